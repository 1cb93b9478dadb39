//! Fixed-size wire frame for progress reports.
//!
//! Layout, eight little-endian `u32` words:
//!
//! ```text
//! [purpose][worker_id][capacity][duration_ms][parts_made][iterations][order_size][num_workers]
//! ```
//!
//! The same frame travels over the POSIX message queue and over UDP. In a
//! completion frame `parts_made` carries the factory's lifetime total.

use thiserror::Error;

use crate::types::WorkerId;

/// Encoded size of one frame.
pub const FRAME_LEN: usize = 32;

/// Raw frame bytes.
pub type Frame = [u8; FRAME_LEN];

const WORDS: usize = FRAME_LEN / 4;

/// Discriminator stored in the first word of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Purpose {
    Request,
    Confirmation,
    Production,
    Completion,
}

impl Purpose {
    pub const fn code(self) -> u32 {
        match self {
            Purpose::Request => 1,
            Purpose::Confirmation => 2,
            Purpose::Production => 3,
            Purpose::Completion => 4,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Purpose::Request),
            2 => Some(Purpose::Confirmation),
            3 => Some(Purpose::Production),
            4 => Some(Purpose::Completion),
            _ => None,
        }
    }
}

/// Fields every factory report carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerTag {
    pub worker_id: WorkerId,
    pub capacity: u32,
    pub duration_ms: u32,
}

/// Decoded progress message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message {
    Request {
        order_size: u32,
    },
    Confirmation {
        num_workers: u32,
    },
    Production {
        worker: WorkerTag,
        parts_made: u32,
    },
    Completion {
        worker: WorkerTag,
        total_parts_made: u32,
        iterations: u32,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame is {0} bytes, expected {FRAME_LEN}")]
    Truncated(usize),
    #[error("unrecognised purpose code {0}")]
    UnknownPurpose(u32),
}

impl Message {
    pub fn purpose(&self) -> Purpose {
        match self {
            Message::Request { .. } => Purpose::Request,
            Message::Confirmation { .. } => Purpose::Confirmation,
            Message::Production { .. } => Purpose::Production,
            Message::Completion { .. } => Purpose::Completion,
        }
    }

    pub fn encode(&self) -> Frame {
        let mut words = [0u32; WORDS];
        words[0] = self.purpose().code();
        match *self {
            Message::Request { order_size } => words[6] = order_size,
            Message::Confirmation { num_workers } => words[7] = num_workers,
            Message::Production { worker, parts_made } => {
                write_tag(&mut words, worker);
                words[4] = parts_made;
            }
            Message::Completion {
                worker,
                total_parts_made,
                iterations,
            } => {
                write_tag(&mut words, worker);
                words[4] = total_parts_made;
                words[5] = iterations;
            }
        }

        let mut frame = [0u8; FRAME_LEN];
        for (chunk, word) in frame.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        frame
    }

    /// Decode a received buffer. Extra trailing bytes are rejected along with short ones.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != FRAME_LEN {
            return Err(WireError::Truncated(bytes.len()));
        }
        let mut words = [0u32; WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        let worker = WorkerTag {
            worker_id: words[1],
            capacity: words[2],
            duration_ms: words[3],
        };
        match Purpose::from_code(words[0]) {
            Some(Purpose::Request) => Ok(Message::Request {
                order_size: words[6],
            }),
            Some(Purpose::Confirmation) => Ok(Message::Confirmation {
                num_workers: words[7],
            }),
            Some(Purpose::Production) => Ok(Message::Production {
                worker,
                parts_made: words[4],
            }),
            Some(Purpose::Completion) => Ok(Message::Completion {
                worker,
                total_parts_made: words[4],
                iterations: words[5],
            }),
            None => Err(WireError::UnknownPurpose(words[0])),
        }
    }
}

fn write_tag(words: &mut [u32; WORDS], tag: WorkerTag) {
    words[1] = tag.worker_id;
    words[2] = tag.capacity;
    words[3] = tag.duration_ms;
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG: WorkerTag = WorkerTag {
        worker_id: 2,
        capacity: 30,
        duration_ms: 750,
    };

    #[test]
    fn production_frame_layout_is_little_endian_words() {
        let frame = Message::Production {
            worker: TAG,
            parts_made: 17,
        }
        .encode();
        assert_eq!(&frame[0..4], &3u32.to_le_bytes());
        assert_eq!(&frame[4..8], &2u32.to_le_bytes());
        assert_eq!(&frame[8..12], &30u32.to_le_bytes());
        assert_eq!(&frame[12..16], &750u32.to_le_bytes());
        assert_eq!(&frame[16..20], &17u32.to_le_bytes());
        assert!(frame[20..].iter().all(|&b| b == 0));
    }

    #[test]
    fn completion_carries_lifetime_total_and_iterations() {
        let msg = Message::Completion {
            worker: TAG,
            total_parts_made: 90,
            iterations: 3,
        };
        assert_eq!(Message::decode(&msg.encode()), Ok(msg));
    }

    #[test]
    fn order_level_fields_survive_the_client_exchange() {
        let request = Message::Request { order_size: 500 };
        let confirm = Message::Confirmation { num_workers: 4 };
        assert_eq!(Message::decode(&request.encode()), Ok(request));
        assert_eq!(Message::decode(&confirm.encode()), Ok(confirm));
    }

    #[test]
    fn unknown_purpose_is_distinguishable() {
        let mut frame = Message::Request { order_size: 1 }.encode();
        frame[0..4].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(Message::decode(&frame), Err(WireError::UnknownPurpose(99)));
    }

    #[test]
    fn wrong_length_is_rejected() {
        let frame = Message::Request { order_size: 1 }.encode();
        assert_eq!(
            Message::decode(&frame[..FRAME_LEN - 1]),
            Err(WireError::Truncated(FRAME_LEN - 1))
        );
        let mut long = frame.to_vec();
        long.push(0);
        assert_eq!(
            Message::decode(&long),
            Err(WireError::Truncated(FRAME_LEN + 1))
        );
    }
}
