fn main() -> Result<(), Box<dyn std::error::Error>> {
    beanfile::cli::run()
}
