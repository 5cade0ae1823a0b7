// Login shell for master tunnelling device accounts.

use tundev_common::types::Role;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tundev_shell::run(Role::Master).await
}
