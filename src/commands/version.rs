pub fn run() {
    println!("kyverno-plugin v{}", env!("CARGO_PKG_VERSION"));
}
