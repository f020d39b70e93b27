//! Sandbox runner binary: a persistent guest namespace behind framed stdio.

use samsara_sandbox::runner::Runner;

fn main() -> std::io::Result<()> {
    let stdin = std::io::stdin().lock();
    let stdout = std::io::stdout().lock();
    Runner::new(stdin, stdout).run()
}
