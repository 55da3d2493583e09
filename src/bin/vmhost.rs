use anyhow::Result;

fn main() -> Result<()> {
    vmhost::cli::run()
}
