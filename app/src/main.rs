fn main() {
    if let Err(err) = mintd::run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}
