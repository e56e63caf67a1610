//! Async entry reader for restoring archives without loading them whole.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::codec::{
    ArchiveEntry, ENTRY_FIELDS_LEN, EntryHeader, WindowOrder, check_preamble, decode_payload,
    parse_header, truncated,
};
use crate::Result;

/// Streams entries from an async source, holding one payload at a time.
pub struct AsyncArchiveReader<R: AsyncRead + Unpin> {
    inner: R,
    order: WindowOrder,
}

impl<R: AsyncRead + Unpin> AsyncArchiveReader<R> {
    pub async fn new(mut inner: R) -> Result<Self> {
        let mut preamble = [0u8; 6];
        inner.read_exact(&mut preamble).await.map_err(truncated)?;
        check_preamble(preamble)?;
        Ok(Self {
            inner,
            order: WindowOrder::default(),
        })
    }

    async fn next_header(&mut self) -> Result<Option<EntryHeader>> {
        let mut name_len = [0u8; 2];
        match self.inner.read(&mut name_len).await? {
            0 => return Ok(None),
            1 => {
                self.inner
                    .read_exact(&mut name_len[1..])
                    .await
                    .map_err(truncated)?;
            }
            _ => {}
        }
        let mut name = vec![0u8; u16::from_le_bytes(name_len) as usize];
        self.inner.read_exact(&mut name).await.map_err(truncated)?;
        let mut fields = [0u8; ENTRY_FIELDS_LEN];
        self.inner.read_exact(&mut fields).await.map_err(truncated)?;
        let header = parse_header(name, fields)?;
        self.order.admit(&header.name)?;
        Ok(Some(header))
    }

    /// Decode the next entry, or `None` at the end of the archive.
    pub async fn next_entry(&mut self) -> Result<Option<ArchiveEntry>> {
        let Some(header) = self.next_header().await? else {
            return Ok(None);
        };
        let mut payload = Vec::new();
        (&mut self.inner)
            .take(header.payload_len)
            .read_to_end(&mut payload)
            .await?;
        decode_payload(header, payload).map(Some)
    }
}
