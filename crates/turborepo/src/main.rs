#[tokio::main]
async fn main() {
    let exit_code = turborepo_lib::main().await;
    std::process::exit(exit_code);
}
