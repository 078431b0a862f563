//! Exports provisioning inputs from `.env` as compile-time environment.
//!
//! Only the `provisioning-mode` build reads them; normal builds take every
//! credential from the SD card at boot.

const PROVISIONING_VARS: [&str; 7] = [
    "ZW_PROV_IDENTITY",
    "ZW_PROV_WIFI_SSID",
    "ZW_PROV_WIFI_PASSWORD",
    "ZW_PROV_BACKEND_HOST",
    "ZW_PROV_BACKEND_PORT",
    "ZW_PROV_BACKEND_PASSWORD",
    "ZW_PROV_UPDATE_HOST",
];

fn main() {
    println!("cargo:rerun-if-changed=.env");
    for var in PROVISIONING_VARS {
        println!("cargo:rerun-if-env-changed={var}");
    }

    if std::env::var_os("CARGO_FEATURE_PROVISIONING_MODE").is_none() {
        return;
    }

    // A missing .env is fine when the variables come from the shell
    if let Err(e) = dotenvy::dotenv() {
        println!("cargo:warning=no .env loaded: {e}");
    }

    for var in PROVISIONING_VARS {
        match std::env::var(var) {
            Ok(value) => println!("cargo:rustc-env={var}={value}"),
            Err(_) => println!("cargo:warning={var} is not set"),
        }
    }
}
