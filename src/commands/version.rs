pub fn run() -> anyhow::Result<()> {
    println!("pac-quota-controller {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
