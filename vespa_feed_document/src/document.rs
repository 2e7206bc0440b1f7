use std::fmt::Display;

use bytes::Bytes;

use crate::DocumentId;

/// The kind of mutation a [`Document`] applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Put,
    Update,
    Remove,
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Put => write!(f, "put"),
            Self::Update => write!(f, "update"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// A single feed operation
///
/// The `body` is the serialized request payload, `{"fields": ...}`, and may be empty for
/// removes. Cloning is cheap since the body is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    id: DocumentId,
    operation: Operation,
    condition: Option<String>,
    create: bool,
    body: Bytes,
}

impl Document {
    pub fn new(id: DocumentId, operation: Operation, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            operation,
            condition: None,
            create: false,
            body: body.into(),
        }
    }

    pub fn put(id: DocumentId, body: impl Into<Bytes>) -> Self {
        Self::new(id, Operation::Put, body)
    }

    pub fn update(id: DocumentId, body: impl Into<Bytes>) -> Self {
        Self::new(id, Operation::Update, body)
    }

    pub fn remove(id: DocumentId) -> Self {
        Self::new(id, Operation::Remove, Bytes::new())
    }

    /// Set a test-and-set condition; an empty condition is treated as no condition
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        let condition = condition.into();
        self.condition = (!condition.is_empty()).then_some(condition);
        self
    }

    /// Create the document if an update targets one that does not exist
    pub fn with_create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    pub fn create(&self) -> bool {
        self.create
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Diagnostic rendering, e.g. `update id:ns:type::a, condition=ns.f > 1, create=true`
impl Display for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.operation, self.id)?;
        if let Some(condition) = &self.condition {
            write!(f, ", condition={condition}")?;
        }
        if self.create {
            write!(f, ", create=true")?;
        }
        Ok(())
    }
}
