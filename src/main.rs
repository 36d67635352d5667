fn main() {
    if let Err(e) = hive_core_lib::run() {
        eprintln!("hive-core: {}", e);
        std::process::exit(1);
    }
}
