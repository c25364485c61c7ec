//! Page store for one main database file.
//!
//! Pages are appended in strict order: a write lands either on an existing
//! page or on the page right past the end. The page size is fixed by the
//! first write that carries the database header and can never change
//! afterwards.

use sqlite_vfs::error::Error;

use crate::error::Error as BackendError;
use crate::format;

type Result<T> = std::result::Result<T, Error<BackendError>>;

#[derive(Default)]
pub struct PageStore {
    page_size: Option<u32>,
    /// The 100-byte header, when it has been written before the first full
    /// page. Until that page arrives the file still reports a size of zero.
    header: Option<Box<[u8]>>,
    pages: Vec<Box<[u8]>>,
}

impl PageStore {
    pub fn page_size(&self) -> Option<u32> {
        self.page_size
    }

    /// Record the page size, e.g. from a `PRAGMA page_size` statement. Once
    /// set it is immutable.
    pub fn apply_page_size(&mut self, page_size: u32) -> Result<()> {
        if !format::is_valid_page_size(page_size) {
            return Err(Error::InvalidPageSize { size: page_size });
        }
        match self.page_size {
            Some(current) if current != page_size => Err(Error::PageSizeChanged),
            _ => {
                self.page_size = Some(page_size);
                Ok(())
            }
        }
    }

    pub fn page_count(&self) -> u64 {
        self.pages.len() as u64
    }

    pub fn len_bytes(&self) -> u64 {
        match self.page_size {
            Some(page_size) => self.pages.len() as u64 * page_size as u64,
            None => 0,
        }
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        // A bare header write fixes the page size and updates the head of the
        // first page, but only a full page write makes the file non-empty.
        if offset == 0 && data.len() == format::DB_HEADER_SIZE {
            let page_size = format::db_page_size(data).map_err(Error::from)?;
            self.apply_page_size(page_size)?;
            match self.pages.first_mut() {
                Some(first) => first[..format::DB_HEADER_SIZE].copy_from_slice(data),
                None => self.header = Some(data.into()),
            }
            return Ok(());
        }

        let page_size = match self.page_size {
            Some(page_size) => page_size,
            None => {
                // No header seen yet; the first page carries it, so a write
                // of the first page can still derive the size.
                if offset != 0 {
                    return Err(Error::WriteOutOfOrder { offset });
                }
                let page_size = format::db_page_size(data).map_err(Error::from)?;
                self.page_size = Some(page_size);
                page_size
            }
        };

        if data.len() != page_size as usize || offset % page_size as u64 != 0 {
            return Err(Error::WriteOutOfOrder { offset });
        }

        let index = (offset / page_size as u64) as usize;
        if index == 0 {
            let derived = format::db_page_size(data).map_err(Error::from)?;
            if derived != page_size {
                return Err(Error::PageSizeChanged);
            }
        }

        match index.cmp(&self.pages.len()) {
            std::cmp::Ordering::Less => {
                self.pages[index].copy_from_slice(data);
            }
            std::cmp::Ordering::Equal => {
                self.pages
                    .try_reserve(1)
                    .map_err(|_| Error::<BackendError>::NoMem)?;
                self.pages.push(alloc_page(data)?);
                self.header = None;
            }
            std::cmp::Ordering::Greater => {
                return Err(Error::WriteOutOfOrder { offset });
            }
        }

        Ok(())
    }

    /// Fill `buf` from the logical byte range starting at `offset`. A range
    /// reaching past the end of the file zero-fills the remainder and reports
    /// a short read.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let total = self.len_bytes();
        if offset >= total {
            buf.fill(0);
            return Err(Error::ShortRead);
        }

        let page_size = self.page_size.unwrap_or(0) as u64;
        let end = total.min(offset + buf.len() as u64);
        let mut pos = offset;
        let mut out = 0;
        while pos < end {
            let page = &self.pages[(pos / page_size) as usize];
            let in_page = (pos % page_size) as usize;
            let n = (page_size as usize - in_page).min((end - pos) as usize);
            buf[out..out + n].copy_from_slice(&page[in_page..in_page + n]);
            pos += n as u64;
            out += n;
        }

        if out < buf.len() {
            buf[out..].fill(0);
            return Err(Error::ShortRead);
        }
        Ok(())
    }

    /// Shrink the file to `size` bytes. Growing is forbidden and the target
    /// must sit on a page boundary.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        if size == 0 {
            self.pages.clear();
            self.header = None;
            return Ok(());
        }

        let page_size = match self.page_size {
            Some(page_size) => page_size as u64,
            None => return Err(Error::TruncateInvalid { size }),
        };
        if size % page_size != 0 || size > self.len_bytes() {
            return Err(Error::TruncateInvalid { size });
        }
        self.pages.truncate((size / page_size) as usize);
        Ok(())
    }

    /// The logical file contents as one contiguous byte buffer.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.try_reserve_exact(self.len_bytes() as usize)
            .map_err(|_| Error::<BackendError>::NoMem)?;
        for page in &self.pages {
            data.extend_from_slice(page);
        }
        Ok(data)
    }

    /// Replace the contents with `data`, re-deriving the page size from the
    /// embedded database header.
    pub fn restore(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            self.pages.clear();
            self.header = None;
            return Ok(());
        }

        let page_size = format::db_page_size(data).map_err(Error::from)?;
        if data.len() % page_size as usize != 0 {
            return Err(BackendError::BadDbSnapshot { len: data.len() }.into());
        }

        let mut pages = Vec::new();
        pages
            .try_reserve_exact(data.len() / page_size as usize)
            .map_err(|_| Error::<BackendError>::NoMem)?;
        for chunk in data.chunks_exact(page_size as usize) {
            pages.push(alloc_page(chunk)?);
        }

        self.page_size = Some(page_size);
        self.header = None;
        self.pages = pages;
        Ok(())
    }
}

fn alloc_page(data: &[u8]) -> Result<Box<[u8]>> {
    let mut page = Vec::new();
    page.try_reserve_exact(data.len())
        .map_err(|_| Error::<BackendError>::NoMem)?;
    page.extend_from_slice(data);
    Ok(page.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(page_size_field: u16) -> Vec<u8> {
        let mut header = vec![0; format::DB_HEADER_SIZE];
        header[16..18].copy_from_slice(&page_size_field.to_be_bytes());
        header
    }

    fn page(page_size: usize, fill: u8) -> Vec<u8> {
        let mut page = vec![fill; page_size];
        page[16..18].copy_from_slice(&(page_size as u16).to_be_bytes());
        page
    }

    #[test]
    fn header_write_sets_page_size_but_not_size() {
        let mut store = PageStore::default();
        store.write(0, &header(512)).unwrap();
        assert_eq!(store.page_size(), Some(512));
        assert_eq!(store.len_bytes(), 0);

        let mut first = page(512, 0);
        first[101] = 1;
        store.write(0, &first).unwrap();
        assert_eq!(store.len_bytes(), 512);

        let mut buf = [0; 512];
        store.read(0, &mut buf).unwrap();
        assert_eq!(buf[101], 1);
    }

    #[test]
    fn first_page_write_derives_page_size() {
        let mut store = PageStore::default();
        store.write(0, &page(512, 0)).unwrap();
        assert_eq!(store.page_size(), Some(512));
        assert_eq!(store.len_bytes(), 512);
    }

    #[test]
    fn page_size_is_immutable() {
        let mut store = PageStore::default();
        store.apply_page_size(512).unwrap();
        assert!(matches!(
            store.apply_page_size(1024),
            Err(Error::PageSizeChanged)
        ));
        assert!(store.write(0, &header(1024)).is_err());
    }

    #[test]
    fn writes_must_be_ordered() {
        let mut store = PageStore::default();
        assert!(matches!(
            store.write(512, &page(512, 1)),
            Err(Error::WriteOutOfOrder { offset: 512 })
        ));

        store.write(0, &page(512, 0)).unwrap();
        assert!(matches!(
            store.write(1024, &page(512, 2)),
            Err(Error::WriteOutOfOrder { offset: 1024 })
        ));
    }

    #[test]
    fn read_past_end_is_short_and_zero_filled() {
        let mut store = PageStore::default();
        let mut buf = [123; 8];
        assert!(matches!(store.read(0, &mut buf), Err(Error::ShortRead)));
        assert_eq!(buf, [0; 8]);

        store.write(0, &page(512, 7)).unwrap();
        let mut buf = [0; 16];
        assert!(matches!(store.read(504, &mut buf), Err(Error::ShortRead)));
        assert_eq!(&buf[..8], &[7; 8]);
        assert_eq!(&buf[8..], &[0; 8]);
    }

    #[test]
    fn read_crosses_page_boundaries() {
        let mut store = PageStore::default();
        store.write(0, &page(512, 1)).unwrap();
        store.write(512, &vec![2; 512]).unwrap();

        let mut buf = [0; 4];
        store.read(510, &mut buf).unwrap();
        assert_eq!(buf, [1, 1, 2, 2]);
    }

    #[test]
    fn truncate_shrinks_on_page_boundaries_only() {
        let mut store = PageStore::default();
        store.truncate(0).unwrap();
        assert!(store.truncate(512).is_err());

        store.write(0, &page(512, 1)).unwrap();
        store.write(512, &vec![2; 512]).unwrap();
        assert!(store.truncate(400).is_err());
        store.truncate(512).unwrap();
        assert_eq!(store.len_bytes(), 512);
        store.truncate(0).unwrap();
        assert_eq!(store.len_bytes(), 0);
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let mut store = PageStore::default();
        store.write(0, &page(512, 1)).unwrap();
        store.write(512, &vec![2; 512]).unwrap();

        let data = store.snapshot().unwrap();
        assert_eq!(data.len(), 1024);

        let mut copy = PageStore::default();
        copy.restore(&data).unwrap();
        assert_eq!(copy.page_size(), Some(512));
        assert_eq!(copy.snapshot().unwrap(), data);
    }
}
