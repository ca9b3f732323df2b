fn main() {
    // macOS only: CoreBluetooth keeps an unbundled CLI binary in the
    // "unauthorised" state unless an Info.plist with
    // NSBluetoothAlwaysUsageDescription is linked into the __TEXT,__info_plist
    // section.  CARGO_CFG_TARGET_OS is the target, so cross builds work too.
    println!("cargo:rerun-if-changed=build.rs");
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR unset; Info.plist not embedded");
        return;
    };

    // ld … -sectcreate __TEXT __info_plist <dir>/Info.plist
    for arg in [
        "-sectcreate".to_owned(),
        "__TEXT".to_owned(),
        "__info_plist".to_owned(),
        format!("{dir}/Info.plist"),
    ] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}
