//! Page manager: the `cluster -> page` / `page -> cluster` bijection that
//! sits between the logical file/directory structures and the raw flash
//! image. NAND and NOR devices keep this mapping in entirely different
//! on-disk shapes (a multi-level node tree vs. per-page reverse pointers),
//! so each gets its own implementation; both are overlaid by the same
//! [`crate::log::PageLog`] replay.

pub mod nand;
pub mod nor;

use std::cell::RefCell;
use std::io::{Read, Result as IoResult, Seek, SeekFrom};
use std::rc::Rc;

use crate::superblock::Superblock;

pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// The flash image, shared by the superblock, page manager, and log reader
/// so all three can seek the same handle without re-opening the file.
pub type SharedIo = Rc<RefCell<dyn ReadSeek>>;

/// `cluster <-> page` translation plus the shared seek helpers every page
/// manager implementation provides identically.
pub trait PageManager {
    fn forward(&self, cluster: u32) -> u32;
    fn reverse(&self, page: u32) -> u32;
    fn superblock(&self) -> &Superblock;
    fn io(&self) -> &SharedIo;
    fn base_offset(&self) -> u64;

    fn forward_to_offset(&self, cluster: u32) -> u64 {
        self.forward(cluster) as u64 * self.superblock().page_size as u64
    }

    fn forward_seek(&self, cluster: u32, offset_from_cluster: u64) -> IoResult<()> {
        let page_size = self.superblock().page_size as u64;
        let pos = self.base_offset() + self.forward_to_offset(cluster) + (offset_from_cluster % page_size);
        self.io().borrow_mut().seek(SeekFrom::Start(pos))?;
        Ok(())
    }
}
