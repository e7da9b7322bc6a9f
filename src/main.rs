fn main() -> anyhow::Result<()> {
    scrib::cli::run()
}
