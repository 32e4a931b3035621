fn main() {
    let args = std::env::args();
    if let Err(err) = walvault::run(args) {
        eprintln!("walvault error: {err:#}");
        std::process::exit(1);
    }
}
