//! CPIO "newc" codec.
//!
//! The kernel's initramfs unpacker accepts exactly this layout:
//!
//! ```text
//! header (110 ASCII bytes) | name + NUL | pad to 4 | data | pad to 4
//! ```
//!
//! Every header field is 8 uppercase hex digits. The archive ends with an
//! entry named `TRAILER!!!`.

use std::io::{self, Write};

use thiserror::Error;

pub const NEWC_MAGIC: &[u8; 6] = b"070701";
/// Same layout with a checksum field; accepted on read only.
pub const NEWC_CRC_MAGIC: &[u8; 6] = b"070702";
pub const HEADER_LEN: usize = 110;
pub const TRAILER_NAME: &str = "TRAILER!!!";

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl EntryKind {
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFDIR => Some(EntryKind::Directory),
            S_IFREG => Some(EntryKind::File),
            S_IFLNK => Some(EntryKind::Symlink),
            S_IFCHR => Some(EntryKind::CharDevice),
            S_IFBLK => Some(EntryKind::BlockDevice),
            S_IFIFO => Some(EntryKind::Fifo),
            S_IFSOCK => Some(EntryKind::Socket),
            _ => None,
        }
    }

    pub fn type_bits(self) -> u32 {
        match self {
            EntryKind::Directory => S_IFDIR,
            EntryKind::File => S_IFREG,
            EntryKind::Symlink => S_IFLNK,
            EntryKind::CharDevice => S_IFCHR,
            EntryKind::BlockDevice => S_IFBLK,
            EntryKind::Fifo => S_IFIFO,
            EntryKind::Socket => S_IFSOCK,
        }
    }

    pub fn is_device(self) -> bool {
        matches!(self, EntryKind::CharDevice | EntryKind::BlockDevice)
    }
}

/// Split a Linux `dev_t` into (major, minor).
pub fn dev_split(rdev: u64) -> (u32, u32) {
    let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
    let minor = (rdev & 0xff) | ((rdev >> 12) & !0xff);
    (major as u32, minor as u32)
}

/// Inverse of [`dev_split`].
pub fn dev_join(major: u32, minor: u32) -> u64 {
    let (major, minor) = (u64::from(major), u64::from(minor));
    ((major & 0xfff) << 8)
        | ((major & !0xfff) << 32)
        | (minor & 0xff)
        | ((minor & !0xff) << 12)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("entry name is empty")]
    Empty,
    #[error("entry name '{0}' is absolute")]
    Absolute(String),
    #[error("entry name '{0}' starts with './'")]
    DotSlash(String),
    #[error("entry name '{0}' escapes the archive root")]
    Escaping(String),
}

/// Check an entry name against the initramfs naming rule: relative, no
/// `./` prefix, no `..` component.
pub fn check_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.starts_with('/') {
        return Err(NameError::Absolute(name.to_string()));
    }
    if name == "." || name.starts_with("./") {
        return Err(NameError::DotSlash(name.to_string()));
    }
    if name.split('/').any(|part| part == "..") {
        return Err(NameError::Escaping(name.to_string()));
    }
    Ok(())
}

/// Raw newc header fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub ino: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mtime: u32,
    pub filesize: u32,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub rdev_major: u32,
    pub rdev_minor: u32,
    /// Includes the trailing NUL.
    pub namesize: u32,
    pub check: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("bad magic {0:?}")]
    BadMagic(String),
    #[error("field {0} is not hex")]
    BadField(&'static str),
}

impl Header {
    pub fn encode(&self) -> String {
        format!(
            "070701{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
            self.ino,
            self.mode,
            self.uid,
            self.gid,
            self.nlink,
            self.mtime,
            self.filesize,
            self.dev_major,
            self.dev_minor,
            self.rdev_major,
            self.rdev_minor,
            self.namesize,
            self.check,
        )
    }

    pub fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self, HeaderError> {
        let magic = &raw[..6];
        if magic != NEWC_MAGIC && magic != NEWC_CRC_MAGIC {
            return Err(HeaderError::BadMagic(
                String::from_utf8_lossy(magic).into_owned(),
            ));
        }

        const NAMES: [&str; 13] = [
            "ino", "mode", "uid", "gid", "nlink", "mtime", "filesize", "devmajor", "devminor",
            "rdevmajor", "rdevminor", "namesize", "check",
        ];
        let mut fields = [0u32; 13];
        for (i, field) in fields.iter_mut().enumerate() {
            let start = 6 + i * 8;
            let text = std::str::from_utf8(&raw[start..start + 8])
                .map_err(|_| HeaderError::BadField(NAMES[i]))?;
            *field = u32::from_str_radix(text, 16).map_err(|_| HeaderError::BadField(NAMES[i]))?;
        }

        Ok(Header {
            ino: fields[0],
            mode: fields[1],
            uid: fields[2],
            gid: fields[3],
            nlink: fields[4],
            mtime: fields[5],
            filesize: fields[6],
            dev_major: fields[7],
            dev_minor: fields[8],
            rdev_major: fields[9],
            rdev_minor: fields[10],
            namesize: fields[11],
            check: fields[12],
        })
    }
}

/// Bytes of padding after `len` bytes to reach a 4-byte boundary.
pub fn pad4(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Streaming newc writer.
///
/// All entries are owned by uid/gid 0, the only owner rock-init expects.
pub struct NewcWriter<W: Write> {
    inner: W,
    next_ino: u32,
    entries: usize,
}

impl<W: Write> NewcWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            next_ino: 1,
            entries: 0,
        }
    }

    /// Entries written so far, trailer excluded.
    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn append_dir(&mut self, name: &str, perms: u32, mtime: u32) -> io::Result<()> {
        self.append(name, EntryKind::Directory, perms, mtime, (0, 0), b"")
    }

    pub fn append_file(&mut self, name: &str, perms: u32, mtime: u32, data: &[u8]) -> io::Result<()> {
        self.append(name, EntryKind::File, perms, mtime, (0, 0), data)
    }

    /// The target is stored verbatim as the entry's data.
    pub fn append_symlink(&mut self, name: &str, target: &str, mtime: u32) -> io::Result<()> {
        self.append(name, EntryKind::Symlink, 0o777, mtime, (0, 0), target.as_bytes())
    }

    pub fn append_special(
        &mut self,
        name: &str,
        kind: EntryKind,
        perms: u32,
        mtime: u32,
        rdev: (u32, u32),
    ) -> io::Result<()> {
        self.append(name, kind, perms, mtime, rdev, b"")
    }

    fn append(
        &mut self,
        name: &str,
        kind: EntryKind,
        perms: u32,
        mtime: u32,
        rdev: (u32, u32),
        data: &[u8],
    ) -> io::Result<()> {
        check_name(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let header = Header {
            ino: self.next_ino,
            mode: kind.type_bits() | (perms & 0o7777),
            nlink: if kind == EntryKind::Directory { 2 } else { 1 },
            mtime,
            rdev_major: rdev.0,
            rdev_minor: rdev.1,
            ..Default::default()
        };
        self.next_ino += 1;
        self.entries += 1;
        self.write_raw(header, name, data)
    }

    /// Write one record as given. `namesize` and `filesize` are filled in
    /// from `name` and `data`; the name is not checked.
    pub fn write_raw(&mut self, mut header: Header, name: &str, data: &[u8]) -> io::Result<()> {
        let too_big = |what: &str| io::Error::new(io::ErrorKind::InvalidInput, format!("{} too large for newc", what));
        header.namesize = u32::try_from(name.len() + 1).map_err(|_| too_big("name"))?;
        header.filesize = u32::try_from(data.len()).map_err(|_| too_big("file"))?;

        self.inner.write_all(header.encode().as_bytes())?;
        self.inner.write_all(name.as_bytes())?;
        self.inner.write_all(&[0])?;
        self.inner
            .write_all(&[0u8; 3][..pad4(HEADER_LEN + name.len() + 1)])?;
        self.inner.write_all(data)?;
        self.inner.write_all(&[0u8; 3][..pad4(data.len())])?;
        Ok(())
    }

    /// Write the trailer and hand back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        let header = Header {
            nlink: 1,
            ..Default::default()
        };
        self.write_raw(header, TRAILER_NAME, b"")?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}
