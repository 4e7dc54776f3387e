fn main() {
    let args = std::env::args();
    if let Err(err) = obsfs::run(args) {
        eprintln!("obsfs error: {err}");
        std::process::exit(1);
    }
}
