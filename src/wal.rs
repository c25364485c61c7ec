//! Frame store for one write-ahead-log file.
//!
//! The file starts with a 32-byte global header; frames follow at
//! `32 + i * (24 + page_size)`, each a 24-byte frame header plus one page of
//! payload. New frames are appended in strict order; the engine may rewrite
//! the header or existing frames in place after a log restart.

use sqlite_vfs::error::Error;

use crate::error::Error as BackendError;
use crate::format;

type Result<T> = std::result::Result<T, Error<BackendError>>;

pub struct Frame {
    header: [u8; format::WAL_FRAME_HEADER_SIZE],
    payload: Box<[u8]>,
}

#[derive(Default)]
pub struct WalStore {
    /// Unset until the engine writes the 32-byte global header; a truncated
    /// log drops it again, so the next writer must start from scratch.
    header: Option<[u8; format::WAL_HEADER_SIZE]>,
    page_size: u32,
    frames: Vec<Frame>,
}

impl WalStore {
    pub fn page_size(&self) -> Option<u32> {
        (self.page_size != 0).then_some(self.page_size)
    }

    pub fn frame_count(&self) -> u64 {
        self.frames.len() as u64
    }

    pub fn len_bytes(&self) -> u64 {
        match self.header {
            Some(_) => format::wal_size(self.page_size, self.frames.len() as u64),
            None => 0,
        }
    }

    /// Apply one write of the host engine. `db_page_size` is the page size of
    /// the main database this log belongs to, when that is already known; a
    /// header write falls back to the page-size field embedded in the header
    /// itself.
    pub fn write(&mut self, offset: u64, data: &[u8], db_page_size: Option<u32>) -> Result<()> {
        if offset == 0 && data.len() == format::WAL_HEADER_SIZE {
            let page_size = match db_page_size {
                Some(page_size) => page_size,
                None => format::wal_page_size(data).map_err(Error::from)?,
            };

            let mut header = [0; format::WAL_HEADER_SIZE];
            header.copy_from_slice(data);
            self.header = Some(header);
            self.page_size = page_size;
            return Ok(());
        }

        if self.header.is_none() || offset < format::WAL_HEADER_SIZE as u64 {
            return Err(Error::WriteOutOfOrder { offset });
        }

        let frame_size = format::wal_frame_size(self.page_size);
        let rel = offset - format::WAL_HEADER_SIZE as u64;
        let index = (rel / frame_size) as usize;
        let in_frame = rel % frame_size;

        if in_frame == 0 && data.len() == format::WAL_FRAME_HEADER_SIZE {
            // Frame header: starts a new frame right past the end, or
            // rewrites an existing one.
            let mut header = [0; format::WAL_FRAME_HEADER_SIZE];
            header.copy_from_slice(data);

            match index.cmp(&self.frames.len()) {
                std::cmp::Ordering::Less => self.frames[index].header = header,
                std::cmp::Ordering::Equal => {
                    self.frames
                        .try_reserve(1)
                        .map_err(|_| Error::<BackendError>::NoMem)?;
                    let mut payload = Vec::new();
                    payload
                        .try_reserve_exact(self.page_size as usize)
                        .map_err(|_| Error::<BackendError>::NoMem)?;
                    payload.resize(self.page_size as usize, 0);
                    self.frames.push(Frame {
                        header,
                        payload: payload.into_boxed_slice(),
                    });
                }
                std::cmp::Ordering::Greater => {
                    return Err(Error::WriteOutOfOrder { offset });
                }
            }
            return Ok(());
        }

        if in_frame == format::WAL_FRAME_HEADER_SIZE as u64 && data.len() == self.page_size as usize
        {
            // Frame payload: the matching frame header must have been written
            // first.
            match self.frames.get_mut(index) {
                Some(frame) => frame.payload.copy_from_slice(data),
                None => return Err(Error::WriteOutOfOrder { offset }),
            }
            return Ok(());
        }

        Err(Error::WriteOutOfOrder { offset })
    }

    /// Byte-accurate read over the logical layout (header, then frames).
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let total = self.len_bytes();
        if offset >= total {
            buf.fill(0);
            return Err(Error::ShortRead);
        }

        let frame_size = format::wal_frame_size(self.page_size);
        let end = total.min(offset + buf.len() as u64);
        let mut pos = offset;
        let mut out = 0;
        while pos < end {
            let (chunk, in_chunk) = if pos < format::WAL_HEADER_SIZE as u64 {
                (
                    &self.header.as_ref().unwrap_or(&[0; format::WAL_HEADER_SIZE])[..],
                    pos as usize,
                )
            } else {
                let rel = pos - format::WAL_HEADER_SIZE as u64;
                let frame = &self.frames[(rel / frame_size) as usize];
                let in_frame = (rel % frame_size) as usize;
                if in_frame < format::WAL_FRAME_HEADER_SIZE {
                    (&frame.header[..], in_frame)
                } else {
                    (&frame.payload[..], in_frame - format::WAL_FRAME_HEADER_SIZE)
                }
            };

            let n = (chunk.len() - in_chunk).min((end - pos) as usize);
            buf[out..out + n].copy_from_slice(&chunk[in_chunk..in_chunk + n]);
            pos += n as u64;
            out += n;
        }

        if out < buf.len() {
            buf[out..].fill(0);
            return Err(Error::ShortRead);
        }
        Ok(())
    }

    /// A WAL file may only ever be truncated to zero (the checkpoint-truncate
    /// path); the next writer then starts over with a fresh header.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        if size != 0 {
            return Err(Error::TruncateInvalid { size });
        }
        self.frames.clear();
        self.header = None;
        self.page_size = 0;
        Ok(())
    }

    /// The logical file contents as one contiguous byte buffer.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let header = match &self.header {
            Some(header) => header,
            None => return Ok(Vec::new()),
        };

        let mut data = Vec::new();
        data.try_reserve_exact(self.len_bytes() as usize)
            .map_err(|_| Error::<BackendError>::NoMem)?;
        data.extend_from_slice(header);
        for frame in &self.frames {
            data.extend_from_slice(&frame.header);
            data.extend_from_slice(&frame.payload);
        }
        Ok(data)
    }

    /// Replace the contents with `data`, re-deriving the page size from the
    /// bundled header.
    pub fn restore(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            self.truncate(0)?;
            return Ok(());
        }

        if data.len() < format::WAL_HEADER_SIZE {
            return Err(BackendError::BadWalSnapshot { len: data.len() }.into());
        }
        let page_size = format::wal_page_size(data).map_err(Error::from)?;
        let frame_size = format::wal_frame_size(page_size) as usize;
        let body = &data[format::WAL_HEADER_SIZE..];
        if body.len() % frame_size != 0 {
            return Err(BackendError::BadWalSnapshot { len: data.len() }.into());
        }

        let mut frames = Vec::new();
        frames
            .try_reserve_exact(body.len() / frame_size)
            .map_err(|_| Error::<BackendError>::NoMem)?;
        for chunk in body.chunks_exact(frame_size) {
            let mut header = [0; format::WAL_FRAME_HEADER_SIZE];
            header.copy_from_slice(&chunk[..format::WAL_FRAME_HEADER_SIZE]);
            let mut payload = Vec::new();
            payload
                .try_reserve_exact(page_size as usize)
                .map_err(|_| Error::<BackendError>::NoMem)?;
            payload.extend_from_slice(&chunk[format::WAL_FRAME_HEADER_SIZE..]);
            frames.push(Frame {
                header,
                payload: payload.into_boxed_slice(),
            });
        }

        let mut header = [0; format::WAL_HEADER_SIZE];
        header.copy_from_slice(&data[..format::WAL_HEADER_SIZE]);
        self.header = Some(header);
        self.page_size = page_size;
        self.frames = frames;
        Ok(())
    }
}
