//! Class finder implementations: an in-memory map, a directory tree and a
//! jar archive.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::PathBuf;

use parking_lot::Mutex;
use zip::ZipArchive;

use crate::runtime::ClassFinder;

#[derive(Debug, thiserror::Error)]
pub enum FinderError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Normalizes a dotted or slashed class name to the slashed form.
fn slashed(name: &[u8]) -> String {
    String::from_utf8_lossy(name).replace('.', "/")
}

/// In-memory finder, mainly for tests and embedding.
#[derive(Default)]
pub struct MapClassFinder {
    classes: Mutex<HashMap<String, Vec<u8>>>,
}

impl MapClassFinder {
    pub fn new() -> MapClassFinder {
        MapClassFinder::default()
    }

    pub fn define(&self, name: &str, bytes: Vec<u8>) {
        self.classes.lock().insert(name.replace('.', "/"), bytes);
    }
}

impl ClassFinder for MapClassFinder {
    fn find(&self, name: &[u8]) -> Option<Vec<u8>> {
        self.classes.lock().get(&slashed(name)).cloned()
    }
}

/// Looks for `<root>/<name>.class` under a directory tree.
pub struct DirClassFinder {
    root: PathBuf,
}

impl DirClassFinder {
    pub fn new(root: impl Into<PathBuf>) -> DirClassFinder {
        DirClassFinder { root: root.into() }
    }
}

impl ClassFinder for DirClassFinder {
    fn find(&self, name: &[u8]) -> Option<Vec<u8>> {
        let mut path = self.root.clone();
        for part in slashed(name).split('/') {
            path.push(part);
        }
        path.set_extension("class");
        std::fs::read(&path).ok()
    }
}

/// Serves `<name>.class` entries out of a jar (zip) archive.
pub struct JarClassFinder<R: Read + Seek + Send = File> {
    archive: Mutex<ZipArchive<R>>,
}

impl JarClassFinder<File> {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FinderError> {
        let file = File::open(path.into())?;
        Ok(JarClassFinder {
            archive: Mutex::new(ZipArchive::new(file)?),
        })
    }
}

impl<R: Read + Seek + Send> JarClassFinder<R> {
    pub fn from_reader(reader: R) -> Result<Self, FinderError> {
        Ok(JarClassFinder {
            archive: Mutex::new(ZipArchive::new(reader)?),
        })
    }
}

impl<R: Read + Seek + Send> ClassFinder for JarClassFinder<R> {
    fn find(&self, name: &[u8]) -> Option<Vec<u8>> {
        let entry = format!("{}.class", slashed(name));
        let mut archive = self.archive.lock();
        let mut file = archive.by_name(&entry).ok()?;
        let mut bytes = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut bytes).ok()?;
        Some(bytes)
    }
}
