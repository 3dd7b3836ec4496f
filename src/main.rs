/// To build a distributable binary with the hardware TPM backend:
/// ```
/// rustup target add x86_64-unknown-linux-musl
/// FDE_KEYMGR_BUILD_STATIC=1 cargo build --release --features tpm2 --target=x86_64-unknown-linux-musl
/// ```
use eyre::Result;
use fde_keymgr::cli::Cli;
use std::env;

fn main() -> Result<()> {
    let cli = Cli::new();
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    env::set_var("TSS2_LOG", "all+NONE");
    cli.run()?;
    Ok(())
}
