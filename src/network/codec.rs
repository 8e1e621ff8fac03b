//! Request/response wire format
//!
//! One JSON document per substream, bounded by [`MAX_FRAME_SIZE`]. The
//! writer closes its half after the document, so the reader knows where a
//! frame ends without a length prefix.

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::request_response;
use libp2p::StreamProtocol;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;

use crate::utils::MAX_PAYLOAD_SIZE;

pub const PROTOCOL_NAME: StreamProtocol = StreamProtocol::new("/ledger/rpc/1.0.0");

/// Room for a full payload spelled out as a JSON byte array.
pub const MAX_FRAME_SIZE: usize = 4 * MAX_PAYLOAD_SIZE + 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    Message {
        kind: String,
        payload: Vec<u8>,
        expects_reply: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Pong,
    Ack,
}

#[derive(Debug, Clone, Default)]
pub struct LedgerCodec;

async fn read_frame<T, M>(io: &mut T) -> io::Result<M>
where
    T: AsyncRead + Unpin + Send,
    M: DeserializeOwned,
{
    let mut buf = Vec::new();
    io.take(MAX_FRAME_SIZE as u64 + 1)
        .read_to_end(&mut buf)
        .await?;
    if buf.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame exceeds the {MAX_FRAME_SIZE} byte limit"),
        ));
    }
    serde_json::from_slice(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_frame<T, M>(io: &mut T, message: &M) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
    M: Serialize,
{
    let bytes =
        serde_json::to_vec(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Frame of {} bytes exceeds the {MAX_FRAME_SIZE} byte limit", bytes.len()),
        ));
    }
    io.write_all(&bytes).await?;
    io.close().await
}

#[async_trait]
impl request_response::Codec for LedgerCodec {
    type Protocol = StreamProtocol;
    type Request = Request;
    type Response = Response;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_frame(io).await
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_frame(io).await
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        request: Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &request).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        response: Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::io::Cursor;
    use libp2p::request_response::Codec;

    #[test]
    fn test_request_frame_is_read_back() {
        let request = Request::Message {
            kind: "account".to_string(),
            payload: vec![1, 2, 3],
            expects_reply: false,
        };
        let mut wire = Cursor::new(Vec::new());
        block_on(LedgerCodec.write_request(&PROTOCOL_NAME, &mut wire, request.clone())).unwrap();

        let mut wire = Cursor::new(wire.into_inner());
        let read = block_on(LedgerCodec.read_request(&PROTOCOL_NAME, &mut wire)).unwrap();
        assert_eq!(read, request);
    }

    #[test]
    fn test_oversized_frame_is_rejected_without_buffering_it_all() {
        // A never-ending array: the reader must stop at the cap
        let mut endless = vec![b'['];
        endless.extend(std::iter::repeat(b"0,".iter().copied()).take(MAX_FRAME_SIZE).flatten());
        let mut wire = Cursor::new(endless);

        let error = block_on(LedgerCodec.read_request(&PROTOCOL_NAME, &mut wire)).unwrap_err();

        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
        assert_eq!(wire.position(), MAX_FRAME_SIZE as u64 + 1);
    }

    #[test]
    fn test_garbage_frame_is_invalid_data() {
        let mut wire = Cursor::new(b"{\"Nope\":1}".to_vec());
        let error = block_on(LedgerCodec.read_response(&PROTOCOL_NAME, &mut wire)).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_oversized_payload_is_not_written() {
        let request = Request::Message {
            kind: "block".to_string(),
            payload: vec![255; MAX_FRAME_SIZE],
            expects_reply: false,
        };
        let mut wire = Cursor::new(Vec::new());
        let error = block_on(LedgerCodec.write_request(&PROTOCOL_NAME, &mut wire, request)).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
        assert!(wire.into_inner().is_empty());
    }
}
