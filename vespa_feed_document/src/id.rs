use std::{fmt::Display, str::FromStr};

/// Failure to parse or construct a [`DocumentId`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid document id: {id:?}: {reason}")]
pub struct IdError {
    id: String,
    reason: &'static str,
}

impl IdError {
    fn new(id: impl Into<String>, reason: &'static str) -> Self {
        Self {
            id: id.into(),
            reason,
        }
    }

    /// The text that failed to parse
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// The optional placement hint of a [`DocumentId`], the `n=` or `g=` option
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Number(i64),
    Group(String),
}

/// Identifier of a document, e.g. `id:music:album:n=42:the-wall`
///
/// Two ids are equal when their logical fields are equal. Options other than `n=` and `g=`
/// are not options at all, they are kept as the start of the user specific part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId {
    namespace: String,
    doc_type: String,
    location: Option<Location>,
    user_specific: String,
}

impl DocumentId {
    /// Build an id from its parts, validating that none of the mandatory parts are empty
    pub fn new(
        namespace: impl Into<String>,
        doc_type: impl Into<String>,
        location: Option<Location>,
        user_specific: impl Into<String>,
    ) -> Result<Self, IdError> {
        let id = Self {
            namespace: namespace.into(),
            doc_type: doc_type.into(),
            location,
            user_specific: user_specific.into(),
        };
        match id.validate() {
            Ok(()) => Ok(id),
            Err(reason) => Err(IdError::new(id.to_string(), reason)),
        }
    }

    /// Every part ends up as a URL path segment, so `.` and `..` are refused as well
    fn validate(&self) -> Result<(), &'static str> {
        if self.namespace.is_empty() || self.namespace.contains(':') {
            return Err("invalid namespace");
        }
        if is_dot_segment(&self.namespace) {
            return Err("namespace is a relative path segment");
        }
        if self.doc_type.is_empty() || self.doc_type.contains(':') {
            return Err("invalid document type");
        }
        if is_dot_segment(&self.doc_type) {
            return Err("document type is a relative path segment");
        }
        if let Some(Location::Group(g)) = &self.location {
            if g.is_empty() || g.contains(':') {
                return Err("invalid group");
            }
            if is_dot_segment(g) {
                return Err("group is a relative path segment");
            }
        }
        if self.user_specific.is_empty() {
            return Err("empty user specific part");
        }
        if is_dot_segment(&self.user_specific) {
            return Err("user specific part is a relative path segment");
        }
        Ok(())
    }

    /// Parse the serialized form `id:<namespace>:<type>:[n=<number>|g=<group>]:<user specific>`
    pub fn parse(serialized: &str) -> Result<Self, IdError> {
        let malformed = |reason| IdError::new(serialized, reason);

        let mut parts = serialized.splitn(4, ':');
        if parts.next() != Some("id") {
            return Err(malformed("missing 'id' scheme"));
        }
        let namespace = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| malformed("empty namespace"))?;
        let doc_type = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| malformed("empty document type"))?;
        let (options, user_specific) = parts
            .next()
            .and_then(|rest| rest.split_once(':'))
            .ok_or_else(|| malformed("missing user specific part"))?;

        if user_specific.is_empty() {
            return Err(malformed("empty user specific part"));
        }

        let mut user_specific = user_specific.to_string();
        let location = if let Some(number) = options.strip_prefix("n=") {
            let number = number
                .parse::<i64>()
                .map_err(|_| malformed("invalid number option"))?;
            Some(Location::Number(number))
        } else if let Some(group) = options.strip_prefix("g=") {
            if group.is_empty() {
                return Err(malformed("empty group option"));
            }
            Some(Location::Group(group.to_string()))
        } else {
            if !options.is_empty() {
                user_specific = format!("{options}:{user_specific}");
            }
            None
        };

        let id = Self {
            namespace: namespace.to_string(),
            doc_type: doc_type.to_string(),
            location,
            user_specific,
        };
        id.validate().map_err(malformed)?;
        Ok(id)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    pub fn number(&self) -> Option<i64> {
        match self.location {
            Some(Location::Number(n)) => Some(n),
            _ => None,
        }
    }

    pub fn group(&self) -> Option<&str> {
        match &self.location {
            Some(Location::Group(g)) => Some(g),
            _ => None,
        }
    }

    /// The part after the options, which may itself contain `:`
    pub fn user_specific(&self) -> &str {
        &self.user_specific
    }
}

fn is_dot_segment(s: &str) -> bool {
    s == "." || s == ".."
}

impl FromStr for DocumentId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "id:{}:{}:", self.namespace, self.doc_type)?;
        match &self.location {
            Some(Location::Number(n)) => write!(f, "n={n}")?,
            Some(Location::Group(g)) => write!(f, "g={g}")?,
            None => {}
        }
        write!(f, ":{}", self.user_specific)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn parse_valid() {
        let cases = [
            ("id:ns:type::user", None, "user"),
            ("id:ns:type:n=123:user", Some(Location::Number(123)), "user"),
            ("id:ns:type:n=-9:user", Some(Location::Number(-9)), "user"),
            (
                "id:ns:type:g=mygroup:user",
                Some(Location::Group("mygroup".into())),
                "user",
            ),
            ("id:ns:type::user::specific", None, "user::specific"),
            ("id:ns:type:::", None, ":"),
            ("id:ns:type:unknown=1:user", None, "unknown=1:user"),
            ("id:ns:type:foo:bar:baz", None, "foo:bar:baz"),
        ];
        for (serialized, location, user_specific) in cases {
            let id = DocumentId::parse(serialized).expect(serialized);
            assert_eq!(id.namespace(), "ns");
            assert_eq!(id.doc_type(), "type");
            assert_eq!(id.location(), location.as_ref(), "{serialized}");
            assert_eq!(id.user_specific(), user_specific, "{serialized}");
        }
    }

    #[test]
    fn parse_malformed() {
        let cases = [
            "",
            "foobar",
            "idd:ns:type:user",
            "id:ns::user",
            "id::type:user",
            "id:ns:type:g=:user",
            "id:ns:type:n=:user",
            "id:ns:type:n=foo:user",
            "id:ns:type::",
            "id:ns:type:user",
            "id:ns:type",
            "id:..:type::user",
            "id:ns:.:n=1:user",
            "id:ns:type:g=..:user",
            "id:ns:type::..",
        ];
        for serialized in cases {
            let err = DocumentId::parse(serialized).expect_err(serialized);
            assert_eq!(err.id(), serialized);
        }
    }

    #[test]
    fn canonical_form() {
        let id: DocumentId = "id:ns:type:n=1:user:x".parse().unwrap();
        assert_eq!(id.to_string(), "id:ns:type:n=1:user:x");
        assert_eq!(id.number(), Some(1));
        assert_eq!(id.group(), None);

        let id: DocumentId = "id:ns:type:g=a:b".parse().unwrap();
        assert_eq!(id.to_string(), "id:ns:type:g=a:b");
        assert_eq!(id.group(), Some("a"));

        let id: DocumentId = "id:ns:type:kept:u".parse().unwrap();
        assert_eq!(id.to_string(), "id:ns:type::kept:u");
        assert_eq!(id.location(), None);
    }

    #[test]
    fn equality_compares_logical_fields() {
        let a: DocumentId = "id:ns:type:foo:bar".parse().unwrap();
        let b: DocumentId = "id:ns:type::foo:bar".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a, DocumentId::new("ns", "type", None, "foo:bar").unwrap());
        assert_ne!(a, "id:ns:type::bar".parse::<DocumentId>().unwrap());
        assert_ne!(a, "id:ns:type:n=1:bar".parse::<DocumentId>().unwrap());
    }

    #[test]
    fn new_validates_parts() {
        assert!(DocumentId::new("", "t", None, "u").is_err());
        assert!(DocumentId::new("ns", "", None, "u").is_err());
        assert!(DocumentId::new("ns", "t", None, "").is_err());
        assert!(DocumentId::new("ns", "t", Some(Location::Group(String::new())), "u").is_err());
        assert!(DocumentId::new("ns", "t", Some(Location::Number(0)), "u").is_ok());
        assert!(DocumentId::new("..", "t", None, "u").is_err());
        assert!(DocumentId::new("ns", ".", None, "u").is_err());
        assert!(DocumentId::new("ns", "t", Some(Location::Group("..".into())), "u").is_err());
        assert!(DocumentId::new("ns", "t", None, "..").is_err());
        assert!(DocumentId::new("ns", "t", None, "a..").is_ok());
    }

    fn arb_location() -> impl Strategy<Value = Option<Location>> {
        prop_oneof![
            Just(None),
            any::<i64>().prop_map(|n| Some(Location::Number(n))),
            "[a-zA-Z0-9_][a-zA-Z0-9_.-]{0,11}".prop_map(|g| Some(Location::Group(g))),
        ]
    }

    proptest! {
        #[test]
        fn canonical_form_round_trips(
            namespace in "[a-z][a-z0-9_]{0,10}",
            doc_type in "[a-z][a-z0-9_]{0,10}",
            location in arb_location(),
            user_specific in "[a-zA-Z0-9:/_=-]{1,24}",
        ) {
            let id = DocumentId::new(namespace, doc_type, location, user_specific).unwrap();
            let parsed = DocumentId::parse(&id.to_string()).unwrap();
            prop_assert_eq!(&parsed, &id);
            prop_assert_eq!(DocumentId::parse(&parsed.to_string()).unwrap(), parsed);
        }
    }
}
