use std::io::{self, BufRead, Read};

use bytes::Bytes;
use serde::Deserialize;
use serde_json::value::RawValue;

use crate::{Document, DocumentId, IdError, Operation};

/// A malformed element in a feed, with the byte offset at which decoding stopped
#[derive(Debug, thiserror::Error)]
#[error("failed to decode feed at byte offset {offset}: {kind}")]
pub struct DecodeError {
    offset: u64,
    #[source]
    kind: DecodeErrorKind,
}

impl DecodeError {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn kind(&self) -> &DecodeErrorKind {
        &self.kind
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeErrorKind {
    #[error("error reading input: {0}")]
    Io(#[source] io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error(transparent)]
    InvalidId(#[from] IdError),

    #[error("expected one of 'put', 'update', 'remove' or 'id'")]
    MissingOperation,

    #[error("found more than one of 'put', 'update', 'remove' or 'id'")]
    MultipleOperations,

    #[error("unexpected character {0:?}")]
    UnexpectedCharacter(char),

    #[error("unexpected end of input")]
    UnexpectedEof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    /// After `[`, expecting an element or `]`
    ArrayStart,
    /// After `,`, expecting an element
    ArrayElement,
    /// After an element, expecting `,` or `]`
    ArrayNext,
    /// After the closing `]`, only whitespace may follow
    ArrayEnd,
    /// Whitespace separated objects
    Objects,
    Done,
}

/// Reads [`Document`]s lazily from a JSON feed
///
/// The input is either a single JSON array of operations or a sequence of whitespace
/// separated operation objects; which one is decided by the first non-whitespace byte. Each
/// operation object looks like
///
/// ```json
/// {"update": "id:ns:type::a", "condition": "type.n > 1", "create": true, "fields": {...}}
/// ```
///
/// where `put`, `update` and `remove` name the operation, and a bare `id` means a put.
///
/// Iteration yields `None` at the end of the feed. A malformed element yields a single
/// [`DecodeError`], after which the decoder is exhausted.
#[derive(Debug)]
pub struct Decoder<R> {
    reader: R,
    offset: u64,
    state: State,
}

impl<R: BufRead> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            offset: 0,
            state: State::Start,
        }
    }

    /// Number of bytes consumed from the input so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Decode the next document, or `Ok(None)` at the end of the feed
    pub fn next_document(&mut self) -> Result<Option<Document>, DecodeError> {
        let result = self.advance();
        if !matches!(result, Ok(Some(_))) {
            self.state = State::Done;
        }
        result
    }

    fn advance(&mut self) -> Result<Option<Document>, DecodeError> {
        loop {
            if self.state == State::Done {
                return Ok(None);
            }
            let next = self
                .skip_whitespace()
                .map_err(|e| self.error(DecodeErrorKind::Io(e)))?;

            match (self.state, next) {
                (State::Start | State::Objects | State::ArrayEnd, None) => return Ok(None),
                (_, None) => return Err(self.error(DecodeErrorKind::UnexpectedEof)),
                (State::Start, Some(b'[')) => {
                    self.consume(1);
                    self.state = State::ArrayStart;
                }
                (State::Start, Some(b'{')) => self.state = State::Objects,
                (State::Objects, Some(b'{')) => return self.read_document().map(Some),
                (State::ArrayStart | State::ArrayElement, Some(b'{')) => {
                    self.state = State::ArrayNext;
                    return self.read_document().map(Some);
                }
                (State::ArrayStart | State::ArrayNext, Some(b']')) => {
                    self.consume(1);
                    self.state = State::ArrayEnd;
                }
                (State::ArrayNext, Some(b',')) => {
                    self.consume(1);
                    self.state = State::ArrayElement;
                }
                (_, Some(c)) => {
                    return Err(self.error(DecodeErrorKind::UnexpectedCharacter(c as char)));
                }
            }
        }
    }

    /// Skip whitespace and peek at the next byte, without consuming it
    fn skip_whitespace(&mut self) -> io::Result<Option<u8>> {
        loop {
            let (skipped, next) = {
                let buf = self.reader.fill_buf()?;
                if buf.is_empty() {
                    return Ok(None);
                }
                let skipped = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
                (skipped, buf.get(skipped).copied())
            };
            self.consume(skipped);
            if next.is_some() {
                return Ok(next);
            }
        }
    }

    fn consume(&mut self, n: usize) {
        self.reader.consume(n);
        self.offset += n as u64;
    }

    fn read_document(&mut self) -> Result<Document, DecodeError> {
        let start = self.offset;
        let (parsed, consumed) = {
            let mut counting = CountingReader {
                inner: &mut self.reader,
                count: 0,
            };
            let parsed = JsonOperation::deserialize(&mut serde_json::Deserializer::from_reader(
                &mut counting,
            ));
            (parsed, counting.count)
        };
        self.offset += consumed;

        let operation = parsed.map_err(|e| self.error(DecodeErrorKind::Json(e)))?;
        operation.into_document().map_err(|kind| DecodeError {
            offset: start,
            kind,
        })
    }

    fn error(&self, kind: DecodeErrorKind) -> DecodeError {
        DecodeError {
            offset: self.offset,
            kind,
        }
    }
}

impl<R: BufRead> Iterator for Decoder<R> {
    type Item = Result<Document, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_document().transpose()
    }
}

/// Tracks how many bytes the JSON deserializer pulled from the underlying reader
#[derive(Debug)]
struct CountingReader<'a, R> {
    inner: &'a mut R,
    count: u64,
}

impl<R: Read> Read for CountingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

#[derive(Debug, Deserialize)]
struct JsonOperation {
    put: Option<String>,
    update: Option<String>,
    remove: Option<String>,
    id: Option<String>,
    fields: Option<Box<RawValue>>,
    condition: Option<String>,
    create: Option<bool>,
}

impl JsonOperation {
    fn into_document(self) -> Result<Document, DecodeErrorKind> {
        let (operation, id) = match (self.put, self.update, self.remove, self.id) {
            (Some(id), None, None, None) | (None, None, None, Some(id)) => (Operation::Put, id),
            (None, Some(id), None, None) => (Operation::Update, id),
            (None, None, Some(id), None) => (Operation::Remove, id),
            (None, None, None, None) => return Err(DecodeErrorKind::MissingOperation),
            _ => return Err(DecodeErrorKind::MultipleOperations),
        };
        let id = DocumentId::parse(&id)?;

        let body = match self.fields {
            Some(fields) => {
                let fields = fields.get();
                let mut body = Vec::with_capacity(fields.len() + 11);
                body.extend_from_slice(b"{\"fields\":");
                body.extend_from_slice(fields.as_bytes());
                body.push(b'}');
                Bytes::from(body)
            }
            None => Bytes::new(),
        };

        let mut document = Document::new(id, operation, body).with_create(self.create == Some(true));
        if let Some(condition) = self.condition {
            document = document.with_condition(condition);
        }
        Ok(document)
    }
}
