use std::fmt;

/// Kind of object a metadata lock protects. The declaration order is the
/// order in which locks of a batch are acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MdlNamespace {
    Global = 0,
    Schema,
    Table,
    Function,
    Procedure,
    Trigger,
    Event,
    Commit,
    UserLevelLock,
}

impl MdlNamespace {
    /// Global, schema and commit locks use the scoped compatibility matrix.
    #[inline]
    pub fn is_scoped(self) -> bool {
        matches!(
            self,
            MdlNamespace::Global | MdlNamespace::Schema | MdlNamespace::Commit
        )
    }

    /// Stage reported to the owner while it waits on a lock of this kind.
    pub fn wait_state_name(self) -> &'static str {
        match self {
            MdlNamespace::Global => "Waiting for global read lock",
            MdlNamespace::Schema => "Waiting for schema metadata lock",
            MdlNamespace::Table => "Waiting for table metadata lock",
            MdlNamespace::Function => "Waiting for stored function metadata lock",
            MdlNamespace::Procedure => "Waiting for stored procedure metadata lock",
            MdlNamespace::Trigger => "Waiting for trigger metadata lock",
            MdlNamespace::Event => "Waiting for event metadata lock",
            MdlNamespace::Commit => "Waiting for commit lock",
            MdlNamespace::UserLevelLock => "User lock",
        }
    }
}

/// Identifies a metadata lock. Keys order by namespace, then database name,
/// then object name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MdlKey {
    namespace: MdlNamespace,
    db_name: String,
    name: String,
}

impl MdlKey {
    pub fn new(namespace: MdlNamespace, db_name: &str, name: &str) -> MdlKey {
        MdlKey {
            namespace,
            db_name: db_name.to_owned(),
            name: name.to_owned(),
        }
    }

    pub fn global() -> MdlKey {
        MdlKey::new(MdlNamespace::Global, "", "")
    }

    pub fn schema(db_name: &str) -> MdlKey {
        MdlKey::new(MdlNamespace::Schema, db_name, "")
    }

    pub fn table(db_name: &str, name: &str) -> MdlKey {
        MdlKey::new(MdlNamespace::Table, db_name, name)
    }

    pub fn commit() -> MdlKey {
        MdlKey::new(MdlNamespace::Commit, "", "")
    }

    #[inline]
    pub fn namespace(&self) -> MdlNamespace {
        self.namespace
    }

    #[inline]
    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for MdlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.db_name.is_empty(), self.name.is_empty()) {
            (true, true) => write!(f, "{:?}", self.namespace),
            (false, true) => write!(f, "{:?} `{}`", self.namespace, self.db_name),
            _ => write!(f, "{:?} `{}`.`{}`", self.namespace, self.db_name, self.name),
        }
    }
}
