fn main() {
    // Only run the ESP-IDF build system when targeting the device.
    // Build scripts run on the host, so check the target OS cargo hands us.
    if let Ok(target_os) = std::env::var("CARGO_CFG_TARGET_OS") {
        if target_os == "espidf" {
            embuild::espidf::sysenv::output();
        }
    }
}
