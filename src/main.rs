fn main() {
    if let Err(e) = garage_billing_lib::run() {
        eprintln!("garage-billing: {e:#}");
        std::process::exit(1);
    }
}
