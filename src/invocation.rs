use serde_json::Value;

use crate::connection::{ApplyOptions, Connection, MethodCallback, MethodResult};

/// Context handed to a method stub.
pub struct MethodInvocation {
    is_simulation: bool,
    connection: Connection,
}

impl MethodInvocation {
    pub(crate) fn simulation(connection: Connection) -> Self {
        Self { is_simulation: true, connection }
    }

    pub fn is_simulation(&self) -> bool {
        self.is_simulation
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Nested invocation. From inside a simulation this runs only the nested
    /// stub and returns its result; nothing is sent to the server.
    pub fn apply(
        &self,
        name: &str,
        args: Vec<Value>,
        options: ApplyOptions,
        callback: Option<MethodCallback>,
    ) -> Option<MethodResult> {
        self.connection.apply_in(Some(self), name, args, options, callback)
    }

    pub fn call(&self, name: &str, args: Vec<Value>) -> MethodResult {
        self.apply(name, args, ApplyOptions::default(), None).unwrap_or(Ok(Value::Null))
    }
}
