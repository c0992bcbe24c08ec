pub mod fixed_size;

/// Size in bytes of a single page. A frame groups `pages_per_frame` of these
/// into one buffered allocation unit (see [`crate::disk_manager::DiskManager`]).
pub const PAGE_SIZE: usize = 4096;

/// Signed page identifier; `-1` names "no page".
pub type PageId = i32;

pub const INVALID_PAGE_ID: PageId = -1;

pub fn is_valid_page_id(page_id: PageId) -> bool {
    page_id >= 0
}
