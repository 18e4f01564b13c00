fn main() {
    if let Err(e) = tabmask_lib::run() {
        eprintln!("tabmask: {}", e);
        std::process::exit(1);
    }
}
