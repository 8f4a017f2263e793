/// Entry point for the `cil-mutant` binary.
fn main() -> anyhow::Result<()> {
    cil_mutant::cli::run()
}
