//! Sources of class file bytes.
//!
//! The loader asks a `ClassProvider` for the bytes of a class by its
//! internal name (`java/lang/Object`). Bytes are shared with the runtime
//! class descriptor, which keeps them alive for as long as the class is
//! loaded.
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use log::trace;
use thiserror::Error;

use crate::jvm;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no class bytes for {0}")]
    NotFound(String),
    #[error("not enough memory to load {0}")]
    OutOfMemory(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed class image at byte {0}")]
    BadImage(usize),
}

pub trait ClassProvider {
    fn load_class(&self, name: &str) -> Result<Rc<[u8]>, ProviderError>;
}

/// Classes held in a map, mostly for embedding and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryProvider {
    classes: HashMap<String, Rc<[u8]>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Rc<[u8]>>) {
        self.classes.insert(name.into(), bytes.into());
    }

    pub fn with(mut self, name: impl Into<String>, bytes: impl Into<Rc<[u8]>>) -> Self {
        self.insert(name, bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl ClassProvider for MemoryProvider {
    fn load_class(&self, name: &str) -> Result<Rc<[u8]>, ProviderError> {
        self.classes
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))
    }
}

/// Packed class image. Each record is laid out as
///
/// +----------------+----------------+------+-----------------+-------+
/// | total (u32 BE) | name len (u16) | name | class len (u32) | class |
/// +----------------+----------------+------+-----------------+-------+
///
/// where `total` counts every byte after itself.
#[derive(Debug, Clone)]
pub struct RomImage {
    image: Rc<[u8]>,
}

impl RomImage {
    pub fn new(image: impl Into<Rc<[u8]>>) -> Self {
        Self {
            image: image.into(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ProviderError> {
        let bytes = jvm::read_class_file(path).map_err(|source| ProviderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(bytes))
    }

    /// Walks the records, yielding each name and class byte range.
    fn records(&self) -> impl Iterator<Item = Result<(&[u8], std::ops::Range<usize>), ProviderError>> + '_ {
        let image: &[u8] = &self.image;
        let mut at = 0usize;
        std::iter::from_fn(move || {
            if at >= image.len() {
                return None;
            }
            let record = at;
            let Some(header) = image.get(at..at + 6) else {
                at = image.len();
                return Some(Err(ProviderError::BadImage(record)));
            };
            let total = BigEndian::read_u32(&header[..4]) as usize;
            let name_len = BigEndian::read_u16(&header[4..]) as usize;
            let name_at = at + 6;
            let len_at = name_at + name_len;
            let Some(class_len) = image.get(len_at..len_at + 4).map(BigEndian::read_u32) else {
                at = image.len();
                return Some(Err(ProviderError::BadImage(record)));
            };
            let class_at = len_at + 4;
            let class_end = class_at + class_len as usize;
            if class_end > image.len() || total < 2 {
                at = image.len();
                return Some(Err(ProviderError::BadImage(record)));
            }
            at = at + 4 + total;
            Some(Ok((&image[name_at..len_at], class_at..class_end)))
        })
    }

    pub fn class_names(&self) -> Vec<String> {
        self.records()
            .filter_map(|r| r.ok())
            .map(|(name, _)| String::from_utf8_lossy(name).into_owned())
            .collect()
    }
}

impl ClassProvider for RomImage {
    fn load_class(&self, name: &str) -> Result<Rc<[u8]>, ProviderError> {
        for record in self.records() {
            let (record_name, range) = record?;
            if record_name == name.as_bytes() {
                trace!("{} found in class image", name);
                return Ok(self.image[range].into());
            }
        }
        Err(ProviderError::NotFound(name.to_string()))
    }
}

/// Builds a packed class image.
#[derive(Debug, Default)]
pub struct RomBuilder {
    image: Vec<u8>,
}

impl RomBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, class: &[u8]) -> io::Result<&mut Self> {
        let name_len = u16::try_from(name.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "class name too long"))?;
        let class_len = u32::try_from(class.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "class too large"))?;
        let total = 2 + name.len() + 4 + class.len();
        let total = u32::try_from(total)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record too large"))?;
        self.image.write_u32::<BigEndian>(total)?;
        self.image.write_u16::<BigEndian>(name_len)?;
        self.image.extend_from_slice(name.as_bytes());
        self.image.write_u32::<BigEndian>(class_len)?;
        self.image.extend_from_slice(class);
        Ok(self)
    }

    pub fn build(self) -> RomImage {
        RomImage::new(self.image)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.image
    }
}

/// Reads `<root>/<name>.class` from disk on every request.
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ClassProvider for DirectoryProvider {
    fn load_class(&self, name: &str) -> Result<Rc<[u8]>, ProviderError> {
        let path = self.root.join(format!("{name}.class"));
        match jvm::read_class_file(&path) {
            Ok(bytes) => {
                trace!("read {}", path.display());
                Ok(bytes.into())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ProviderError::NotFound(name.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::OutOfMemory => {
                Err(ProviderError::OutOfMemory(name.to_string()))
            }
            Err(source) => Err(ProviderError::Io { path, source }),
        }
    }
}

/// Asks each provider in turn; the first one that has the class wins.
#[derive(Default)]
pub struct ProviderChain {
    providers: Vec<Box<dyn ClassProvider>>,
}

impl ProviderChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, provider: Box<dyn ClassProvider>) {
        self.providers.push(provider);
    }

    pub fn with(mut self, provider: impl ClassProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl ClassProvider for ProviderChain {
    fn load_class(&self, name: &str) -> Result<Rc<[u8]>, ProviderError> {
        for provider in &self.providers {
            match provider.load_class(name) {
                Err(ProviderError::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(ProviderError::NotFound(name.to_string()))
    }
}
