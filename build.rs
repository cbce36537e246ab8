use std::env;
use std::io;
use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    if Path::new(".git").exists() {
        println!("cargo:rerun-if-changed=.git/HEAD");
        println!("cargo:rerun-if-changed=.git/refs");
    }

    let pkg_version = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());
    let described = match git_describe() {
        Ok(desc) => desc,
        Err(e) => {
            println!("cargo:warning=not embedding git revision: {}", e);
            "unknown".to_string()
        }
    };

    println!("cargo:rustc-env=ONIONWRAP_GIT_DESCRIBE={}", described);
    println!(
        "cargo:rustc-env=ONIONWRAP_BUILD_VERSION={} ({})",
        pkg_version, described
    );
}

fn git_describe() -> io::Result<String> {
    let output = Command::new("git")
        .args(["describe", "--always", "--dirty", "--tags"])
        .output()?;
    if !output.status.success() {
        return Err(io::Error::other(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
