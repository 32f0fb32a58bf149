//! Enrollment directory scanning, change fingerprinting and identity table builds.
//!
//! Layout: `<root>/<identity name>/<image>.{png,jpg,jpeg,bmp}`. Sub-directories
//! are visited in name order, which fixes the table order used for tie-breaks.

use crate::detector::{DetectFaces, DetectorError};
use crate::recognizer::{ExtractEmbedding, RecognizerError};
use crate::types::{Identity, IdentityTable, RgbView};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("enrollment directory {path} unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("none of {images} enrollment images produced an embedding")]
    NoUsableImages { images: usize },
}

/// Why a single enrollment image contributed nothing.
#[derive(Error, Debug)]
enum ImageError {
    #[error("decode: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("no face detected")]
    NoFace,
}

/// One identity directory and its candidate images.
#[derive(Debug, Clone)]
pub struct EnrolledPerson {
    pub name: String,
    pub images: Vec<PathBuf>,
}

/// Cheap change detector for the enrollment tree.
///
/// Directory and file counts mirror the coarse signal the deployment has always
/// used; the digest additionally covers renames and in-place image swaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub directories: usize,
    pub files: usize,
    pub digest: [u8; 32],
}

impl Fingerprint {
    pub fn digest_hex(&self) -> String {
        self.digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn unreadable(path: &Path) -> impl FnOnce(io::Error) -> EnrollmentError + '_ {
    move |source| EnrollmentError::Unreadable { path: path.to_path_buf(), source }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

fn sorted_entries(dir: &Path) -> Result<Vec<fs::DirEntry>, EnrollmentError> {
    let mut entries = fs::read_dir(dir)
        .map_err(unreadable(dir))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(unreadable(dir))?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

/// Fingerprint every directory and file below `root`.
pub fn fingerprint(root: &Path) -> Result<Fingerprint, EnrollmentError> {
    let mut directories = 0usize;
    let mut files = 0usize;
    let mut hasher = Sha256::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in sorted_entries(&dir)? {
            let path = entry.path();
            let meta = entry.metadata().map_err(unreadable(&path))?;
            let rel = path.strip_prefix(root).unwrap_or(&path);
            hasher.update(rel.to_string_lossy().as_bytes());

            if meta.is_dir() {
                directories += 1;
                hasher.update(b"/");
                stack.push(path);
            } else {
                files += 1;
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos())
                    .unwrap_or(0);
                hasher.update(meta.len().to_le_bytes());
                hasher.update(mtime.to_le_bytes());
            }
        }
    }

    Ok(Fingerprint {
        directories,
        files,
        digest: hasher.finalize().into(),
    })
}

/// List identity directories (sorted by name) and their image files.
///
/// Loose files directly under `root` are ignored.
pub fn scan(root: &Path) -> Result<Vec<EnrolledPerson>, EnrollmentError> {
    let mut people = Vec::new();
    for entry in sorted_entries(root)? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let images = sorted_entries(&path)?
            .into_iter()
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        people.push(EnrolledPerson {
            name: entry.file_name().to_string_lossy().into_owned(),
            images,
        });
    }
    Ok(people)
}

/// Embed the highest-confidence face of one enrollment image.
fn embed_image(
    path: &Path,
    detector: &mut dyn DetectFaces,
    recognizer: &mut dyn ExtractEmbedding,
) -> Result<crate::types::Embedding, ImageError> {
    let rgb = image::open(path)?.to_rgb8();
    let view = RgbView::new(rgb.as_raw(), rgb.width(), rgb.height());
    let faces = detector.detect_faces(view, 1)?;
    let face = faces.first().ok_or(ImageError::NoFace)?;
    Ok(recognizer.extract_embedding(view, face)?)
}

/// Build a fresh identity table from the enrollment directory.
///
/// Bad images are skipped with a warning and identities left without any
/// embedding are omitted. The build only fails when the directory cannot be
/// read or when images exist but none of them yields an embedding.
pub fn build_table(
    root: &Path,
    detector: &mut dyn DetectFaces,
    recognizer: &mut dyn ExtractEmbedding,
    generation: u64,
) -> Result<IdentityTable, EnrollmentError> {
    let people = scan(root)?;
    let mut identities = Vec::with_capacity(people.len());
    let mut total_images = 0usize;
    let mut skipped = 0usize;

    for person in people {
        total_images += person.images.len();
        let mut embeddings = Vec::with_capacity(person.images.len());

        for image_path in &person.images {
            match embed_image(image_path, detector, recognizer) {
                Ok(embedding) => embeddings.push(embedding),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(
                        identity = %person.name,
                        image = %image_path.display(),
                        error = %e,
                        "skipping enrollment image"
                    );
                }
            }
        }

        if embeddings.is_empty() {
            tracing::warn!(identity = %person.name, "no usable enrollment images; identity omitted");
            continue;
        }
        identities.push(Identity::new(person.name, embeddings));
    }

    if total_images > 0 && identities.is_empty() {
        return Err(EnrollmentError::NoUsableImages { images: total_images });
    }

    let table = IdentityTable::new(identities, generation);
    tracing::info!(
        generation,
        identities = table.len(),
        embeddings = table.embedding_count(),
        skipped,
        "identity table built"
    );
    Ok(table)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding};
    use image::{Rgb, RgbImage};

    /// Reports one face whenever the image is not pure black.
    pub(crate) struct FakeDetector;

    impl DetectFaces for FakeDetector {
        fn detect_faces(&mut self, image: RgbView<'_>, _max: usize) -> Result<Vec<BoundingBox>, DetectorError> {
            if image.data.iter().all(|&p| p == 0) {
                return Ok(vec![]);
            }
            Ok(vec![BoundingBox {
                x: 0.0,
                y: 0.0,
                width: image.width as f32,
                height: image.height as f32,
                confidence: 0.9,
                landmarks: None,
            }])
        }
    }

    /// Embedding is the colour of the top-left pixel.
    pub(crate) struct ColorRecognizer;

    impl ExtractEmbedding for ColorRecognizer {
        fn extract_embedding(&mut self, image: RgbView<'_>, _face: &BoundingBox) -> Result<Embedding, RecognizerError> {
            Ok(Embedding::new(image.pixel(0, 0).iter().map(|&c| c as f32).collect()))
        }
    }

    pub(crate) fn write_face(dir: &Path, person: &str, file: &str, color: [u8; 3]) {
        let person_dir = dir.join(person);
        fs::create_dir_all(&person_dir).unwrap();
        RgbImage::from_pixel(8, 8, Rgb(color)).save(person_dir.join(file)).unwrap();
    }

    #[test]
    fn test_build_table_groups_by_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "bob", "1.png", [0, 255, 0]);
        write_face(dir.path(), "alice", "1.png", [255, 0, 0]);
        write_face(dir.path(), "alice", "2.png", [250, 5, 0]);

        let table = build_table(dir.path(), &mut FakeDetector, &mut ColorRecognizer, 7).unwrap();
        assert_eq!(table.generation(), 7);
        let names: Vec<&str> = table.identities().iter().map(|i| &*i.name).collect();
        assert_eq!(names, ["alice", "bob"]);
        assert_eq!(table.get("alice").unwrap().embeddings.len(), 2);
    }

    #[test]
    fn test_build_table_skips_bad_images() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "alice", "good.png", [255, 0, 0]);
        write_face(dir.path(), "alice", "dark.png", [0, 0, 0]);
        fs::write(dir.path().join("alice").join("corrupt.jpg"), b"not a jpeg").unwrap();
        fs::write(dir.path().join("alice").join("notes.txt"), b"ignored").unwrap();
        write_face(dir.path(), "ghost", "dark.png", [0, 0, 0]);

        let table = build_table(dir.path(), &mut FakeDetector, &mut ColorRecognizer, 1).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("alice").unwrap().embeddings.len(), 1);
        assert!(table.get("ghost").is_none());
    }

    #[test]
    fn test_build_table_total_failure() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "alice", "dark.png", [0, 0, 0]);
        let err = build_table(dir.path(), &mut FakeDetector, &mut ColorRecognizer, 1).unwrap_err();
        assert!(matches!(err, EnrollmentError::NoUsableImages { images: 1 }));
    }

    #[test]
    fn test_build_table_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_table(&dir.path().join("nope"), &mut FakeDetector, &mut ColorRecognizer, 1).unwrap_err();
        assert!(matches!(err, EnrollmentError::Unreadable { .. }));
    }

    #[test]
    fn test_empty_directory_builds_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let table = build_table(dir.path(), &mut FakeDetector, &mut ColorRecognizer, 1).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_fingerprint_counts_and_changes() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "alice", "1.png", [255, 0, 0]);
        let before = fingerprint(dir.path()).unwrap();
        assert_eq!((before.directories, before.files), (1, 1));
        assert_eq!(before, fingerprint(dir.path()).unwrap());

        write_face(dir.path(), "dave", "1.png", [0, 0, 255]);
        let after = fingerprint(dir.path()).unwrap();
        assert_eq!((after.directories, after.files), (2, 2));
        assert_ne!(before.digest, after.digest);
    }

    #[test]
    fn test_fingerprint_detects_rename_with_same_counts() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "alice", "1.png", [255, 0, 0]);
        let before = fingerprint(dir.path()).unwrap();

        fs::rename(dir.path().join("alice"), dir.path().join("alicia")).unwrap();
        let after = fingerprint(dir.path()).unwrap();
        assert_eq!((before.directories, before.files), (after.directories, after.files));
        assert_ne!(before, after);
        assert_eq!(after.digest_hex().len(), 64);
    }
}
