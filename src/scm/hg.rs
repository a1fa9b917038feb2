//! Mercurial checkouts

use super::Vcs;
use crate::error::Result;
use std::path::Path;

pub async fn checkout(vcs: Vcs<'_>, url: &str, revision: &str, dir: &Path) -> Result<()> {
    let target = dir.to_string_lossy().to_string();
    vcs.run(
        vcs.command()
            .env("HGPLAIN", "1")
            .args(["clone", "--noninteractive", "--rev", revision, "--updaterev", revision])
            .args([url, target.as_str()]),
        format!(
            "Cloning the Mercurial repository failed. Please verify the supplied reference of \"{}\" is valid.",
            revision
        ),
    )
    .await?;
    Ok(())
}
