//! Git hook management.
//!
//! `hooks --install` links every file under `hooks/` into `.git/hooks/`;
//! `hooks --uninstall` removes everything from `.git/hooks/`. Hook scripts
//! are repository content, not server functionality.

use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::config::HooksArgs;

/// Source directory for hook scripts.
const HOOKS_DIR: &str = "hooks";
/// Where git looks for hooks.
const GIT_HOOKS_DIR: &str = ".git/hooks";

#[derive(Debug, Error)]
pub enum HooksError {
    #[error("--install and --uninstall are mutually exclusive")]
    ConflictingFlags,
    #[error("no action specified, use --install or --uninstall")]
    NoAction,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Entry point for the `hooks` subcommand.
pub fn run(args: &HooksArgs) -> Result<(), HooksError> {
    match (args.install, args.uninstall) {
        (true, true) => Err(HooksError::ConflictingFlags),
        (false, false) => Err(HooksError::NoAction),
        (true, false) => install(),
        (false, true) => uninstall(),
    }
}

fn install() -> Result<(), HooksError> {
    for entry in fs::read_dir(HOOKS_DIR)? {
        let entry = entry?;
        let name = entry.file_name();
        let target = Path::new(GIT_HOOKS_DIR).join(&name);

        match link_hook(&entry.path(), &target) {
            Ok(()) => println!("Installed {}", name.to_string_lossy()),
            Err(e) => eprintln!("failed to install {}: {e}", name.to_string_lossy()),
        }
    }

    Ok(())
}

fn uninstall() -> Result<(), HooksError> {
    for entry in fs::read_dir(GIT_HOOKS_DIR)? {
        let entry = entry?;
        let name = entry.file_name();

        match fs::remove_file(entry.path()) {
            Ok(()) => println!("Uninstalled {}", name.to_string_lossy()),
            Err(e) => eprintln!("failed to uninstall {}: {e}", name.to_string_lossy()),
        }
    }

    Ok(())
}

/// Symlink where the platform supports it, copy where it does not.
#[cfg(unix)]
fn link_hook(source: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::canonicalize(source)?, target)
}

#[cfg(windows)]
fn link_hook(source: &Path, target: &Path) -> io::Result<()> {
    fs::copy(source, target).map(|_| ())
}
