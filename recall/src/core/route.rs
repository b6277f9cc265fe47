//! Conditional dispatch: guards and query routing.

use serde_json::json;
use tracing::debug;

use crate::core::error::{Failure, OpError, OpResult};
use crate::core::op::{Operation, SharedCondition, SharedOp};
use crate::core::state::{ROUTE, State};

/// Runs `on_fail` when `condition` does not hold, otherwise passes through.
pub struct Gate {
    name: String,
    condition: SharedCondition,
    on_fail: SharedOp,
}

impl Gate {
    pub fn new(condition: SharedCondition, on_fail: SharedOp) -> Self {
        Self {
            name: "Gate".to_string(),
            condition,
            on_fail,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Operation for Gate {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, mut state: State) -> OpResult {
        let passed = self.condition.check(&state);
        state.log(
            &self.name,
            json!({ "passed": passed, "condition": self.condition.name() }),
        );
        if passed {
            return Ok(state);
        }
        debug!(gate = %self.name, on_fail = self.on_fail.name(), "gate closed");
        self.on_fail.run(state)
    }
}

struct Route {
    name: String,
    condition: SharedCondition,
    op: SharedOp,
}

/// Runs the first route whose condition holds.
///
/// The chosen route name is written to `query.meta.route`. With no match the
/// default runs; with no default the state passes through unless
/// `require_match` is set.
pub struct QueryRouter {
    name: String,
    routes: Vec<Route>,
    default: Option<SharedOp>,
    require_match: bool,
}

impl Default for QueryRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryRouter {
    pub fn new() -> Self {
        Self {
            name: "QueryRouter".to_string(),
            routes: Vec::new(),
            default: None,
            require_match: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn route(
        mut self,
        name: impl Into<String>,
        condition: SharedCondition,
        op: SharedOp,
    ) -> Self {
        self.routes.push(Route {
            name: name.into(),
            condition,
            op,
        });
        self
    }

    pub fn default_route(mut self, op: SharedOp) -> Self {
        self.default = Some(op);
        self
    }

    pub fn require_match(mut self) -> Self {
        self.require_match = true;
        self
    }

    fn select(&self, state: &State) -> (&str, Option<&SharedOp>) {
        match self
            .routes
            .iter()
            .find(|route| route.condition.check(state))
        {
            Some(route) => (route.name.as_str(), Some(&route.op)),
            None => match &self.default {
                Some(op) => ("default", Some(op)),
                None => ("none", None),
            },
        }
    }
}

impl Operation for QueryRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, mut state: State) -> OpResult {
        let (route, op) = self.select(&state);
        let route = route.to_string();
        debug!(router = %self.name, route = %route, "route selected");
        state.query.meta.insert(ROUTE.to_string(), json!(route));
        state.log(&self.name, json!({ "route": route }));

        match op {
            Some(op) => op.run(state),
            None if self.require_match => Err(Failure::new(
                OpError::precondition(&self.name, "a matching route"),
                state,
            )),
            None => Ok(state),
        }
    }
}
