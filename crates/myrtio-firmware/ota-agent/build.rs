fn main() {
    println!("cargo:rerun-if-changed=.env");
    println!("cargo:rerun-if-env-changed=BUILD_VERSION");
    println!("cargo:rustc-link-arg=-Tlinkall.x");

    dotenv_build::output(dotenv_build::Config {
        filename: std::path::Path::new(".env"),
        recursive_search: true,
        fail_if_missing_dotenv: false,
    })
    .unwrap();

    // Version token reported by this build, must match the version endpoint
    // exactly once the image is published
    let version = std::env::var("BUILD_VERSION")
        .unwrap_or_else(|_| chrono::Utc::now().format("%Y%m%d%H%M%S").to_string());
    println!("cargo:rustc-env=BUILD_VERSION={version}");
}
