pub fn get_version() -> String {
    String::from(option_env!("GIT_DESCRIBE").unwrap_or(env!("CARGO_PKG_VERSION")))
}
