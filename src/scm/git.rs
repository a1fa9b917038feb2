//! Git checkouts limited to the requested commit

use super::Vcs;
use crate::error::{Result, VendorError};
use std::path::Path;
use tracing::{debug, warn};

/// Checks `revision` out into `dir`
///
/// `dir` is empty, or `seeded` with an earlier `.git` of the same repository whose
/// objects the fetch can skip. Fetches only the commit itself first; servers that
/// refuse fetching by id get a full fetch before the checkout.
pub async fn checkout(
    vcs: Vcs<'_>,
    url: &str,
    revision: &str,
    dir: &Path,
    seeded: bool,
) -> Result<()> {
    let git = || vcs.command().cwd(dir).env("GIT_TERMINAL_PROMPT", "0");

    vcs.run(git().args(["init", "--quiet"]), "Initializing the Git repository failed")
        .await?;
    let remote = if seeded { "set-url" } else { "add" };
    vcs.run(
        git().args(["remote", remote, "origin", url]),
        "Configuring the Git remote failed",
    )
    .await?;

    let shallow = vcs
        .run(
            git().args(["fetch", "--quiet", "--depth", "1", "origin", revision]),
            "Cloning the Git repository failed",
        )
        .await;
    match shallow {
        Ok(_) => debug!(url, revision, "Fetched the commit directly"),
        Err(VendorError::Fetch(_)) => {
            warn!(url, revision, "Shallow fetch by commit refused, fetching full history");
            vcs.run(
                git().args(["fetch", "--quiet", "--tags", "origin"]),
                "Cloning the Git repository failed",
            )
            .await?;
        }
        Err(other) => return Err(other),
    }

    vcs.run(
        git().args(["checkout", "--quiet", "--force", revision]),
        format!(
            "Checking out the Git repository failed. Please verify the supplied reference of \"{}\" is valid.",
            revision
        ),
    )
    .await?;
    Ok(())
}
