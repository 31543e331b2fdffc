fn main() {
    if let Err(e) = depth_acquire_lib::run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
