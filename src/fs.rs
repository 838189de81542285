//! The mounted-filesystem façade: resolves paths, lists directories, and
//! opens files, wiring together the superblock, page manager, log, and
//! directory database into the single handle the CLI/shell operate on.

use std::rc::Rc;

use chrono::{DateTime, Utc};

use crate::cefs::{CefsPageManager, CefsSuperblock};
use crate::db::Database;
use crate::error::{Efs2Error, Result};
use crate::inode::{self, Inode, InodeReader};
use crate::info::FsInfo;
use crate::pm::nand::{NandLog, NandPageManager};
use crate::pm::nor::{NorLog, NorPageManager};
use crate::pm::{PageManager, SharedIo};
use crate::superblock::{self, Regions, UpperDataIndex};

/// Where to start looking for the filesystem's superblock chain.
#[derive(Debug, Clone)]
pub enum BaseOffset {
    /// Scan from the start of the image and let the superblock/log math
    /// (NAND) or first-candidate offset (NOR) decide the real start.
    Auto,
    Explicit(u64),
    /// Resolved against a partition table found in the image itself.
    Partition(String),
}

impl Default for BaseOffset {
    fn default() -> Self {
        BaseOffset::Auto
    }
}

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub base_offset: BaseOffset,
    /// `None` picks the highest-age valid candidate; `Some(n)` forces the
    /// n-th candidate scanned regardless of validity.
    pub superblock_ordinal: Option<usize>,
    pub cefs: bool,
    pub encoding: &'static encoding_rs::Encoding,
    pub no_log: bool,
    /// Block size used only when resolving `BaseOffset::Partition` against
    /// an embedded partition table.
    pub partition_block_size: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            base_offset: BaseOffset::Auto,
            superblock_ordinal: None,
            cefs: false,
            encoding: encoding_rs::WINDOWS_1252,
            no_log: false,
            partition_block_size: 0x20000,
        }
    }
}

/// A `stat`-style snapshot of one directory entry, decoupled from the
/// live `Inode` so callers don't need a `PageManager` reference to read
/// it back later.
#[derive(Debug, Clone)]
pub struct Stat {
    pub name: String,
    pub inode: Option<u32>,
    pub mode: u32,
    pub file_size: u64,
    pub blocks: u32,
    pub generation: u32,
    pub modified_time: Option<DateTime<Utc>>,
    pub created_time: Option<DateTime<Utc>>,
    pub accessed_time: Option<DateTime<Utc>>,
    pub is_inline: bool,
}

impl From<&Inode> for Stat {
    fn from(i: &Inode) -> Self {
        Stat {
            name: i.name.clone(),
            inode: i.id,
            mode: i.mode,
            file_size: i.file_size,
            blocks: i.blocks,
            generation: i.generation,
            modified_time: i.modified_time,
            created_time: i.created_time,
            accessed_time: i.accessed_time,
            is_inline: i.inline_data.is_some() && i.id.is_none(),
        }
    }
}

/// What `Filesystem::open` hands back: a seekable reader for a regular
/// (or inline) file, or the raw target bytes of a symlink that the
/// caller asked not to follow.
pub enum OpenResult {
    File(InodeReader),
    SymlinkTarget(Vec<u8>),
}

/// One mounted EFS2 or CEFS image. Holds the page manager, the eagerly
/// materialized directory database, and the current working directory.
pub struct Filesystem {
    pm: Rc<dyn PageManager>,
    db: Database,
    root_inode: u32,
    cur_dir: u32,
    pwd: String,
    encoding: &'static encoding_rs::Encoding,
    base_offset: u64,
}

fn read_cluster_bytes(pm: &Rc<dyn PageManager>, cluster: u32, len: usize) -> Result<Vec<u8>> {
    pm.forward_seek(cluster, 0)?;
    let mut buf = vec![0u8; len];
    {
        use std::io::Read;
        let mut io = pm.io().borrow_mut();
        io.read_exact(&mut buf)?;
    }
    Ok(buf)
}

impl Filesystem {
    /// Mounts an EFS2 or CEFS image over `io` per `opts`. Dispatches to
    /// [`Self::mount_cefs`] when `opts.cefs` is set.
    pub fn mount(io: SharedIo, opts: &MountOptions) -> Result<Self> {
        if opts.cefs {
            return Self::mount_cefs(io, opts);
        }

        let (scan_start, scan_end) = Self::resolve_scan_window(&io, opts)?;

        let scan_result = {
            let mut fio = io.borrow_mut();
            superblock::scan(&mut *fio, scan_start, scan_end, opts.superblock_ordinal)?
        };

        let sb = scan_result.superblock;
        let efs_size = sb.page_total as u64 * sb.page_size as u64;

        let (efs_start, efs_end) = if sb.is_nand {
            let nand = sb.nand.as_ref().ok_or_else(|| Efs2Error::CorruptStructure("NAND superblock missing region table".into()))?;
            let sb_count = nand.regions[Regions::SuperLogEnd as usize].wrapping_sub(nand.regions[Regions::SuperLogStart as usize]);
            let efs_end = scan_result.first_sb_offset + sb_count as u64 * sb.block_length as u64;
            let efs_start = efs_end.saturating_sub(efs_size);
            (efs_start, efs_end)
        } else {
            let efs_end = scan_result.last_sb_offset + sb.block_length as u64;
            (scan_result.first_sb_offset, efs_end)
        };
        let _ = efs_end;

        let base_offset = match opts.base_offset {
            BaseOffset::Auto => efs_start,
            _ => scan_start,
        };

        // The NAND log's `sb_start_page` quirk: the original passes the
        // chosen superblock's byte offset (relative to the resolved base
        // offset) straight into a page-index shift comparison without
        // converting units. Retained as-is.
        let sb_start_page = scan_result.chosen_offset.saturating_sub(base_offset) as u32;

        let sb_rc = Rc::new(sb.clone());

        let pm: Rc<dyn PageManager> = if sb.is_nand {
            let mut pm = NandPageManager::new(sb_rc.clone(), io.clone(), base_offset);
            if !opts.no_log {
                let log = NandLog::scan(&sb, &io, base_offset, sb_start_page)?;
                pm.set_log(Rc::new(log));
            }
            Rc::new(pm)
        } else {
            let mut pm = NorPageManager::new(sb_rc.clone(), io.clone(), base_offset);
            if !opts.no_log {
                let log = NorLog::scan(&sb, &io, base_offset, &pm)?;
                pm.set_log(Rc::new(log));
            }
            pm.compute_ptables()?;
            Rc::new(pm)
        };

        Self::finish_mount(pm, &sb.upper_data, opts.encoding, base_offset)
    }

    fn resolve_scan_window(io: &SharedIo, opts: &MountOptions) -> Result<(u64, Option<u64>)> {
        match &opts.base_offset {
            BaseOffset::Explicit(n) => Ok((*n, None)),
            BaseOffset::Auto => Ok((0, None)),
            BaseOffset::Partition(name) => {
                let mut fio = io.borrow_mut();
                let (start, end) = crate::partition::lookup(&mut *fio, name, opts.partition_block_size)?;
                Ok((start, end))
            }
        }
    }

    /// Mounts a CEFS ("gang image") factory dump: no log journal, page
    /// translation recovered from a flat free-cluster bitmap.
    fn mount_cefs(io: SharedIo, opts: &MountOptions) -> Result<Self> {
        let start = match &opts.base_offset {
            BaseOffset::Explicit(n) => *n,
            BaseOffset::Auto => 0,
            BaseOffset::Partition(name) => {
                let mut fio = io.borrow_mut();
                crate::partition::lookup(&mut *fio, name, opts.partition_block_size)?.0
            }
        };

        let header = {
            use std::io::{Read, Seek, SeekFrom};
            let mut fio = io.borrow_mut();
            fio.seek(SeekFrom::Start(start))?;
            let mut buf = vec![0u8; 0x80000];
            let n = fio.read(&mut buf)?;
            buf.truncate(n);
            buf
        };

        let factory = CefsSuperblock::parse(&header)?;
        let sb_rc = Rc::new(factory.as_superblock());

        let cefs_pm = CefsPageManager::new(&factory, sb_rc.clone(), io.clone(), start)?;
        cefs_pm.compute_ptables()?;
        let pm: Rc<dyn PageManager> = Rc::new(cefs_pm);

        Self::finish_mount(pm, &factory.upper_data, opts.encoding, start)
    }

    fn finish_mount(pm: Rc<dyn PageManager>, upper_data: &[u32], encoding: &'static encoding_rs::Encoding, base_offset: u64) -> Result<Self> {
        let fs_info_cluster = upper_data[UpperDataIndex::FsInfo as usize];
        let fs_info_bytes = read_cluster_bytes(&pm, fs_info_cluster, 32)?;
        let fs_info = FsInfo::parse(&fs_info_bytes)?;

        let db_root = upper_data[UpperDataIndex::DbRoot as usize];
        let db = Database::mount(db_root, &pm, encoding)?;

        Ok(Self {
            pm,
            db,
            root_inode: fs_info.root_inode,
            cur_dir: fs_info.root_inode,
            pwd: "/".to_string(),
            encoding,
            base_offset,
        })
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn pwd(&self) -> &str {
        &self.pwd
    }

    pub fn encoding(&self) -> &'static encoding_rs::Encoding {
        self.encoding
    }

    pub fn set_encoding(&mut self, encoding: &'static encoding_rs::Encoding) {
        self.db.set_encoding(encoding);
        self.encoding = encoding;
    }

    fn decode(&self, bytes: &[u8]) -> String {
        let (decoded, _, _) = self.encoding.decode(bytes);
        decoded.into_owned()
    }

    fn classify(&self, item: &crate::db::DatabaseItem) -> Result<Inode> {
        if item.inode.is_some() {
            Inode::read(item, &self.pm, self.encoding)
        } else if let Some(target) = &item.symlink_path {
            Ok(Inode::symlink(self.decode(&item.name), target.clone()))
        } else if let Some(inline) = &item.inline {
            Ok(Inode::from_inline(self.decode(&item.name), inline))
        } else {
            Err(Efs2Error::CorruptStructure("directory entry has no inode, symlink target, or inline data".into()))
        }
    }

    /// Resolves `pathname` to its final inode plus the list of path
    /// components walked (used by `cd` to rebuild `pwd`). An empty
    /// pathname resolves `.` against the current directory.
    fn resolve(&self, pathname: &str) -> Result<(Inode, Vec<String>)> {
        let path = if pathname.len() <= 1 { pathname } else { pathname.trim_end_matches('/') };
        let mut resolved = Vec::new();

        let mut parts: Vec<&str> = path.split('/').collect();
        let mut cur = self.cur_dir;

        if parts.first().map(|p| p.is_empty()).unwrap_or(false) {
            resolved.push(String::new());
            cur = self.root_inode;
            parts.remove(0);
        }

        let n = parts.len();
        for (i, p) in parts.iter().enumerate() {
            if p.is_empty() {
                continue;
            }
            resolved.push(p.to_string());

            let expect_file = i >= n.saturating_sub(1);
            let item = self.db.lookup(cur, p).ok_or_else(|| Efs2Error::FileNotFound(pathname.to_string()))?;
            let inode = self.classify(item)?;

            if expect_file {
                return Ok((inode, resolved));
            }
            if !inode::is_dir(inode.mode) {
                return Err(Efs2Error::NotADirectory(pathname.to_string()));
            }
            cur = item.inode.ok_or_else(|| Efs2Error::NotADirectory(pathname.to_string()))?;
        }

        let dot = self.db.lookup(cur, ".").ok_or_else(|| Efs2Error::FileNotFound(pathname.to_string()))?;
        Ok((self.classify(dot)?, resolved))
    }

    fn format_name(inode: &Inode) -> String {
        if inode::is_dir(inode.mode) && inode.name != "." && inode.name != ".." {
            format!("{}/", inode.name)
        } else {
            inode.name.clone()
        }
    }

    /// Lists `pathname`'s contents (or the current directory's, for an
    /// empty path), or the single entry itself if it names a file.
    pub fn ls(&self, pathname: &str) -> Result<Vec<(String, Inode)>> {
        let dir_inode_id = if pathname.is_empty() {
            self.cur_dir
        } else {
            let (file, _) = self.resolve(pathname)?;
            if !inode::is_dir(file.mode) {
                return Ok(vec![(Self::format_name(&file), file)]);
            }
            file.id.ok_or_else(|| Efs2Error::NotADirectory(pathname.to_string()))?
        };

        let mut out = Vec::new();
        for item in self.db.list(dir_inode_id) {
            let inode = self.classify(item)?;
            out.push((Self::format_name(&inode), inode));
        }
        Ok(out)
    }

    /// Recursively lists everything under `pathname`, skipping `.`/`..`
    /// and prefixing each result with `pathname`.
    pub fn ls_recursive(&self, pathname: &str) -> Result<Vec<(String, Inode)>> {
        let mut out = Vec::new();
        for (name, info) in self.ls(pathname)? {
            if name != "." && name != ".." {
                let full = format!("{pathname}{name}");
                let is_dir = inode::is_dir(info.mode);
                out.push((full.clone(), info));
                if is_dir {
                    out.extend(self.ls_recursive(&full)?);
                }
            }
        }
        Ok(out)
    }

    pub fn cd(&mut self, pathname: &str) -> Result<()> {
        let (file, resolved_path) = self.resolve(pathname)?;
        if !inode::is_dir(file.mode) {
            return Err(Efs2Error::NotADirectory(pathname.to_string()));
        }

        let mut pwd_parts: Vec<String> = if pathname.starts_with('/') {
            Vec::new()
        } else {
            self.pwd.trim_end_matches('/').split('/').map(|s| s.to_string()).filter(|s| !s.is_empty()).collect()
        };

        for fp in &resolved_path {
            if fp == ".." {
                pwd_parts.pop();
            } else if fp != "." && !fp.is_empty() {
                pwd_parts.push(fp.clone());
            }
        }

        self.pwd = format!("/{}", pwd_parts.join("/"));
        if !self.pwd.ends_with('/') {
            self.pwd.push('/');
        }
        self.cur_dir = file.id.ok_or_else(|| Efs2Error::NotADirectory(pathname.to_string()))?;
        Ok(())
    }

    pub fn stat(&self, pathname: &str) -> Result<Stat> {
        let (file, _) = self.resolve(pathname)?;
        Ok(Stat::from(&file))
    }

    /// Opens `pathname`. When it names a symlink and `follow_symlinks` is
    /// true, resolves through to the link target (decoded with the
    /// façade's current encoding) instead of returning the link bytes.
    pub fn open(&self, pathname: &str, follow_symlinks: bool) -> Result<OpenResult> {
        let (file, _) = self.resolve(pathname)?;

        if inode::is_symlink(file.mode) {
            let target = file.inline_data.unwrap_or_default();
            if follow_symlinks {
                let target_path = self.decode(&target);
                return self.open(&target_path, true);
            }
            return Ok(OpenResult::SymlinkTarget(target));
        }

        Ok(OpenResult::File(InodeReader::new(&file, self.pm.clone())?))
    }
}
