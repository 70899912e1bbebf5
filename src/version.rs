const fn build_version_or_package(opt: Option<&'static str>) -> &'static str {
    match opt {
        Some(val) => val,
        None => env!("CARGO_PKG_VERSION"),
    }
}

/// Release tag injected by CI through `APP_VERSION`, else the crate version.
pub const VERSION: &str = build_version_or_package(option_env!("APP_VERSION"));
