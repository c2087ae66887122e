//! Ready-made database containers.
//!
//! Both presets read the same property keys:
//!
//! | key           | default                      |
//! |---------------|------------------------------|
//! | `image`       | the preset's image           |
//! | `db`          | random                       |
//! | `dbuser`      | random                       |
//! | `dbpass`      | random                       |
//! | `initdb_path` | none; mounted as init dir    |
//!
//! `driver` is always set so callers can tell the engines apart.

pub mod mysql;
pub mod postgres;

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::container::PropertyMap;
use crate::error::{Error, Result};
use crate::random;

pub const PROP_IMAGE: &str = "image";
pub const PROP_DB: &str = "db";
pub const PROP_USER: &str = "dbuser";
pub const PROP_PASS: &str = "dbpass";
pub const PROP_INITDB: &str = "initdb_path";
pub const PROP_DRIVER: &str = "driver";

/// Script extensions the official images run on first start.
const INIT_EXTENSIONS: &[&str] = &["sql", "sh", "gz", "xz", "zst"];

/// Credentials after defaults were filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub db: String,
    pub user: String,
    pub pass: String,
}

/// Fill in missing credentials with random values and stamp the driver.
pub(crate) fn fill_defaults(props: &mut PropertyMap, driver: &str) -> Credentials {
    props.insert(PROP_DRIVER, driver);
    props.set_if_missing(PROP_DB, random::name());
    props.set_if_missing(PROP_USER, random::name());
    props.set_if_missing(PROP_PASS, random::name());
    Credentials {
        db: props.get_or_default(PROP_DB, ""),
        user: props.get_or_default(PROP_USER, ""),
        pass: props.get_or_default(PROP_PASS, ""),
    }
}

/// Check an init-script directory and return its absolute path along with
/// the number of scripts found directly inside it.
pub fn init_scripts_dir(path: &str) -> Result<(PathBuf, usize)> {
    let dir = Path::new(path);
    if !dir.is_dir() {
        return Err(Error::config(format!("initdb path {path} is not a directory")));
    }
    let dir = std::path::absolute(dir)?;

    let mut scripts = 0;
    for entry in WalkDir::new(&dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(std::result::Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let is_script = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| INIT_EXTENSIONS.contains(&e));
        if is_script {
            debug!(script = %entry.path().display(), "init script");
            scripts += 1;
        }
    }
    if scripts == 0 {
        warn!(path = %dir.display(), "initdb directory has no scripts");
    }
    Ok((dir, scripts))
}
