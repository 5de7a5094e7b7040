use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

const IMAGE_EXT: &str = ".png";
const KEY_SEPARATOR: char = '_';

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("registry I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> RegistryError + '_ {
    move |source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A stored reference photo. Pixels stay on disk until [`Enrollment::load_image`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enrollment {
    pub id: String,
    pub display_name: String,
    pub image_path: PathBuf,
}

impl Enrollment {
    pub fn load_image(&self) -> Result<DynamicImage, RegistryError> {
        image::open(&self.image_path).map_err(|source| RegistryError::Image {
            path: self.image_path.clone(),
            source,
        })
    }
}

/// Directory of reference photos named `{id}_{display_name}.png`.
///
/// The key splits at the first underscore, so ids never contain one.
/// Re-enrolling an id replaces its previous photo, whatever the old name.
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    /// Open (or create) the photo directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        tracing::debug!(dir = %dir.display(), "registry opened");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store `image` as the reference photo for `id`.
    pub fn enroll(
        &self,
        id: &str,
        display_name: &str,
        image: &DynamicImage,
    ) -> Result<Enrollment, RegistryError> {
        let id = validate_id(id)?;
        let display_name = validate_name(display_name)?;

        let file_name = format!("{id}{KEY_SEPARATOR}{display_name}{IMAGE_EXT}");
        let image_path = self.dir.join(&file_name);
        // Dot-prefixed so a crash mid-write never looks like an enrollment.
        let part_path = self.dir.join(format!(".{file_name}.part"));

        image
            .save_with_format(&part_path, ImageFormat::Png)
            .map_err(|source| RegistryError::Image {
                path: part_path.clone(),
                source,
            })?;
        fs::rename(&part_path, &image_path).map_err(io_error(&image_path))?;

        for (stale, _) in self.scan()? {
            if stale.id == id && stale.image_path != image_path {
                fs::remove_file(&stale.image_path).map_err(io_error(&stale.image_path))?;
                tracing::info!(id, previous = %stale.display_name, "replaced earlier enrollment");
            }
        }

        tracing::info!(id, display_name, path = %image_path.display(), "enrolled");
        Ok(Enrollment {
            id: id.to_string(),
            display_name: display_name.to_string(),
            image_path,
        })
    }

    /// Latest reference photo for `id`, without decoding it.
    pub fn find_by_id(&self, id: &str) -> Result<Option<Enrollment>, RegistryError> {
        let id = id.trim();
        let mut matches: Vec<_> = self.scan()?.into_iter().filter(|(e, _)| e.id == id).collect();
        if matches.len() > 1 {
            tracing::warn!(id, count = matches.len(), "multiple photos for one id; using the newest");
        }
        matches.sort_by(|(a, at), (b, bt)| at.cmp(bt).then_with(|| a.image_path.cmp(&b.image_path)));
        Ok(matches.pop().map(|(e, _)| e))
    }

    /// One enrollment per id, sorted by id.
    pub fn list(&self) -> Result<Vec<Enrollment>, RegistryError> {
        let mut all = self.scan()?;
        all.sort_by(|(a, at), (b, bt)| {
            a.id.cmp(&b.id)
                .then_with(|| bt.cmp(at))
                .then_with(|| b.image_path.cmp(&a.image_path))
        });
        all.dedup_by(|(later, _), (kept, _)| later.id == kept.id);
        Ok(all.into_iter().map(|(e, _)| e).collect())
    }

    fn scan(&self) -> Result<Vec<(Enrollment, SystemTime)>, RegistryError> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_error(&self.dir))? {
            let entry = entry.map_err(io_error(&self.dir))?;
            let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Some((id, display_name)) = parse_key(&file_name) else {
                continue;
            };
            let path = entry.path();
            let meta = entry.metadata().map_err(io_error(&path))?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((
                Enrollment {
                    id,
                    display_name,
                    image_path: path,
                },
                modified,
            ));
        }
        Ok(found)
    }
}

/// Split `{id}_{display_name}.png` into its parts.
fn parse_key(file_name: &str) -> Option<(String, String)> {
    if file_name.starts_with('.') {
        return None;
    }
    let stem = file_name.strip_suffix(IMAGE_EXT)?;
    let (id, name) = stem.split_once(KEY_SEPARATOR)?;
    if id.is_empty() || name.is_empty() {
        return None;
    }
    Some((id.to_string(), name.to_string()))
}

fn has_path_chars(s: &str) -> bool {
    s.chars().any(|c| c == '/' || c == '\\' || c.is_control())
}

/// Trimmed `id`, or why it cannot key an enrollment.
pub fn validate_id(id: &str) -> Result<&str, RegistryError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(RegistryError::MissingField("id"));
    }
    if id.contains(KEY_SEPARATOR) {
        return Err(RegistryError::InvalidField {
            field: "id",
            reason: "must not contain '_'",
        });
    }
    if id.starts_with('.') || has_path_chars(id) {
        return Err(RegistryError::InvalidField {
            field: "id",
            reason: "must not start with '.' or contain path separators",
        });
    }
    Ok(id)
}

pub fn validate_name(name: &str) -> Result<&str, RegistryError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RegistryError::MissingField("display_name"));
    }
    if has_path_chars(name) {
        return Err(RegistryError::InvalidField {
            field: "display_name",
            reason: "must not contain path separators",
        });
    }
    Ok(name)
}
