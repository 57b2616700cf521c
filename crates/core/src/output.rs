//! References to artifacts produced on the server.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Storage area for finished outputs.
pub const OUTPUT_TYPE_OUTPUT: &str = "output";

/// Storage area for previews and intermediate files.
pub const OUTPUT_TYPE_TEMP: &str = "temp";

/// A reference to a server-side artifact (not its content).
///
/// The bytes are fetched separately through the `view` endpoint using
/// [`query_params`](Self::query_params).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataOutput {
    pub filename: String,
    /// Path below the storage area; empty for the area root.
    #[serde(default)]
    pub subfolder: String,
    /// Which storage area the file lives in (`output`, `temp`, `input`).
    #[serde(rename = "type")]
    pub kind: String,
}

impl DataOutput {
    /// Query parameters identifying this artifact on the `view` endpoint.
    pub fn query_params(&self) -> [(&'static str, &str); 3] {
        [
            ("filename", self.filename.as_str()),
            ("subfolder", self.subfolder.as_str()),
            ("type", self.kind.as_str()),
        ]
    }

    /// Whether the artifact is a finished output rather than a preview.
    pub fn is_final(&self) -> bool {
        self.kind == OUTPUT_TYPE_OUTPUT
    }

    /// Relative path to save this artifact under, `subfolder/filename`.
    ///
    /// Both parts come from the server. Only plain path segments are kept,
    /// so the result never escapes the directory it is joined onto.
    /// `None` when the filename has no usable final segment.
    pub fn local_path(&self) -> Option<PathBuf> {
        let name = Path::new(&self.filename).file_name()?;

        let mut path: PathBuf = Path::new(&self.subfolder)
            .components()
            .filter_map(|c| match c {
                Component::Normal(segment) => Some(segment),
                _ => None,
            })
            .collect();
        path.push(name);
        Some(path)
    }
}
