//! Chunked transfer encoding support
//!
//! Upload bodies are framed chunk by chunk as the caller supplies data;
//! chunked response bodies are decoded incrementally as bytes arrive.

use super::{Error, Result, CRLF};
use bytes::{BufMut, BytesMut};

/// Terminal zero-length chunk with an empty trailer
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Frame `data` as one chunk and append it to `out`
///
/// Empty input produces nothing; ending the body is `LAST_CHUNK`'s job.
pub fn encode_chunk(out: &mut BytesMut, data: &[u8]) {
    if data.is_empty() {
        return;
    }

    let size = format!("{:x}{}", data.len(), CRLF);
    out.reserve(size.len() + data.len() + CRLF.len());
    out.put_slice(size.as_bytes());
    out.put_slice(data);
    out.put_slice(CRLF.as_bytes());
}

/// Chunked decoder
///
/// Decodes HTTP chunked transfer encoding format
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: DecoderState,
    chunk_size: usize,
    chunk_read: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecoderState {
    ChunkSize,
    ChunkData,
    ChunkEnd,
    Trailer,
    Complete,
}

impl ChunkedDecoder {
    /// Create a new chunked decoder
    pub fn new() -> Self {
        ChunkedDecoder {
            state: DecoderState::ChunkSize,
            chunk_size: 0,
            chunk_read: 0,
        }
    }

    /// Decode a chunk from the input buffer
    ///
    /// Returns (bytes_consumed, bytes_decoded, is_complete)
    pub fn decode(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize, bool)> {
        let mut input_pos = 0;
        let mut output_pos = 0;

        while input_pos < input.len() && output_pos < output.len() {
            match self.state {
                DecoderState::ChunkSize => {
                    let Some(crlf_pos) = find_crlf(&input[input_pos..]) else {
                        break;
                    };

                    let line = String::from_utf8_lossy(&input[input_pos..input_pos + crlf_pos]);
                    let size_str = line.split(';').next().unwrap_or_default().trim();
                    self.chunk_size = usize::from_str_radix(size_str, 16)
                        .map_err(|_| Error::InvalidChunkSize(size_str.to_string()))?;

                    input_pos += crlf_pos + 2;
                    self.chunk_read = 0;
                    self.state = if self.chunk_size == 0 {
                        DecoderState::Trailer
                    } else {
                        DecoderState::ChunkData
                    };
                }

                DecoderState::ChunkData => {
                    let remaining_in_chunk = self.chunk_size - self.chunk_read;
                    let available_input = input.len() - input_pos;
                    let available_output = output.len() - output_pos;

                    let to_copy = remaining_in_chunk.min(available_input).min(available_output);

                    output[output_pos..output_pos + to_copy]
                        .copy_from_slice(&input[input_pos..input_pos + to_copy]);

                    input_pos += to_copy;
                    output_pos += to_copy;
                    self.chunk_read += to_copy;

                    if self.chunk_read == self.chunk_size {
                        self.state = DecoderState::ChunkEnd;
                    } else {
                        break;
                    }
                }

                DecoderState::ChunkEnd => {
                    if input.len() - input_pos < 2 {
                        break;
                    }
                    if &input[input_pos..input_pos + 2] != b"\r\n" {
                        return Err(Error::Protocol("Expected CRLF after chunk".to_string()));
                    }
                    input_pos += 2;
                    self.state = DecoderState::ChunkSize;
                }

                DecoderState::Trailer => {
                    if input.len() - input_pos < 2 {
                        break;
                    }
                    if &input[input_pos..input_pos + 2] == b"\r\n" {
                        input_pos += 2;
                        self.state = DecoderState::Complete;
                        return Ok((input_pos, output_pos, true));
                    }
                    // Trailer fields are skipped up to the empty line
                    match find_crlf(&input[input_pos..]) {
                        Some(crlf_pos) => input_pos += crlf_pos + 2,
                        None => break,
                    }
                }

                DecoderState::Complete => {
                    return Ok((input_pos, output_pos, true));
                }
            }
        }

        Ok((input_pos, output_pos, self.state == DecoderState::Complete))
    }

    /// Check if decoding is complete
    pub fn is_complete(&self) -> bool {
        self.state == DecoderState::Complete
    }

    /// Reset the decoder for reuse
    pub fn reset(&mut self) {
        self.state = DecoderState::ChunkSize;
        self.chunk_size = 0;
        self.chunk_read = 0;
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Find CRLF in buffer
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Decode complete chunked body from bytes
pub fn decode_chunked_body(input: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ChunkedDecoder::new();
    let mut output = Vec::new();
    let mut input_pos = 0;
    let mut temp = vec![0u8; 8192];

    while input_pos < input.len() {
        let (consumed, decoded, complete) = decoder.decode(&input[input_pos..], &mut temp)?;

        output.extend_from_slice(&temp[..decoded]);
        input_pos += consumed;

        if complete || (consumed == 0 && decoded == 0) {
            break;
        }
    }

    if !decoder.is_complete() {
        return Err(Error::Protocol("Incomplete chunked body".to_string()));
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_single_chunk() {
        let mut output = BytesMut::new();
        encode_chunk(&mut output, b"Hello");
        output.extend_from_slice(LAST_CHUNK);

        assert_eq!(&output[..], b"5\r\nHello\r\n0\r\n\r\n");
    }

    #[test]
    fn test_encode_hex_size() {
        let mut output = BytesMut::new();
        encode_chunk(&mut output, &[b'x'; 300]);
        assert!(output.starts_with(b"12c\r\n"));
        assert!(output.ends_with(b"x\r\n"));
    }

    #[test]
    fn test_empty_chunks_ignored() {
        let mut output = BytesMut::new();
        encode_chunk(&mut output, b"");
        assert!(output.is_empty());
    }

    #[test]
    fn test_decode_multiple_chunks() {
        let input = b"5\r\nHello\r\n5\r\nWorld\r\n0\r\n\r\n";
        let output = decode_chunked_body(input).unwrap();
        assert_eq!(output, b"HelloWorld");
    }

    #[test]
    fn test_decode_with_extension_and_trailer() {
        let input = b"5;extension=value\r\nHello\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let output = decode_chunked_body(input).unwrap();
        assert_eq!(output, b"Hello");
    }

    #[test]
    fn test_decode_bad_size() {
        assert!(matches!(
            decode_chunked_body(b"zz\r\nHello\r\n0\r\n\r\n"),
            Err(Error::InvalidChunkSize(_))
        ));
    }

    #[test]
    fn test_decode_incomplete() {
        assert!(decode_chunked_body(b"5\r\nHel").is_err());
    }

    #[test]
    fn test_decoder_incremental() {
        let input = b"5\r\nHello\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut output = vec![0u8; 100];
        let mut pending = Vec::new();
        let mut total_decoded = 0;

        for piece in input.chunks(3) {
            pending.extend_from_slice(piece);
            let (consumed, decoded, complete) =
                decoder.decode(&pending, &mut output[total_decoded..]).unwrap();
            pending.drain(..consumed);
            total_decoded += decoded;

            if complete {
                break;
            }
        }

        assert_eq!(&output[..total_decoded], b"Hello");
        assert!(decoder.is_complete());
    }

    #[test]
    fn test_decoder_small_output_window() {
        let input = b"a\r\n0123456789\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut window = [0u8; 4];
        let mut output = Vec::new();
        let mut pos = 0;

        loop {
            let (consumed, decoded, complete) = decoder.decode(&input[pos..], &mut window).unwrap();
            output.extend_from_slice(&window[..decoded]);
            pos += consumed;
            if complete {
                break;
            }
        }

        assert_eq!(output, b"0123456789");
    }
}
