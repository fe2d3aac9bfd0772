fn main() {
    if let Err(err) = csv_translator::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
