//! Frame-stacked variable scope for watch execution.
//!
//! Every watch pushes a frame for the duration of its `process` call; values
//! pushed inside the frame (the `hash` binding, selector `store` outputs,
//! loop variables) vanish when the frame pops. Below all frames sits a
//! process-scope map written by `set_variable`, which survives frame churn —
//! that is where watches bind fetched data for their parents to read.

use indexmap::IndexMap;
use thiserror::Error;

use crate::template::{self, Lookup, TemplateError};
use crate::value::Value;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("frame misnest: expected to pop '{expected}', found '{found}'")]
    FrameMisnest { expected: String, found: String },

    #[error("frame underflow: pop of '{0}' with no frame pushed")]
    FrameUnderflow(String),

    #[error("variable underflow: pop of '{0}' with no pushed value")]
    VariableUnderflow(String),
}

#[derive(Debug, Default)]
struct Frame {
    id: String,
    vars: IndexMap<String, Vec<Value>>,
}

/// Stacked variable scope with a process-wide fallback map.
#[derive(Debug, Default)]
pub struct Context {
    frames: Vec<Frame>,
    scope: IndexMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            // Root frame for pushes made outside any watch (tests, hooks).
            frames: vec![Frame::default()],
            scope: IndexMap::new(),
        }
    }

    pub fn push_frame(&mut self, id: &str) {
        self.frames.push(Frame {
            id: id.to_string(),
            vars: IndexMap::new(),
        });
    }

    pub fn pop_frame(&mut self, id: &str) -> Result<(), ContextError> {
        if self.frames.len() <= 1 {
            return Err(ContextError::FrameUnderflow(id.to_string()));
        }
        let top = self.frames.last().map(|f| f.id.clone()).unwrap_or_default();
        if top != id {
            return Err(ContextError::FrameMisnest {
                expected: id.to_string(),
                found: top,
            });
        }
        self.frames.pop();
        Ok(())
    }

    /// Push a value onto the named stack in the current frame.
    pub fn push_variable(&mut self, name: &str, value: Value) {
        let frame = self.frames.last_mut().expect("root frame always present");
        frame.vars.entry(name.to_string()).or_default().push(value);
    }

    /// Pop the most recent value for `name` from the current frame.
    pub fn pop_variable(&mut self, name: &str) -> Result<Value, ContextError> {
        let frame = self.frames.last_mut().expect("root frame always present");
        let stack = frame
            .vars
            .get_mut(name)
            .ok_or_else(|| ContextError::VariableUnderflow(name.to_string()))?;
        let value = stack
            .pop()
            .ok_or_else(|| ContextError::VariableUnderflow(name.to_string()))?;
        if stack.is_empty() {
            frame.vars.shift_remove(name);
        }
        Ok(value)
    }

    /// Write to the process scope, independent of any frame.
    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.scope.insert(name.to_string(), value);
    }

    /// Scan frames top-down, then the process scope.
    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        for frame in self.frames.iter().rev() {
            if let Some(stack) = frame.vars.get(name) {
                if let Some(value) = stack.last() {
                    return Some(value);
                }
            }
        }
        self.scope.get(name)
    }

    pub fn get_or(&self, name: &str, default: Value) -> Value {
        self.get_variable(name).cloned().unwrap_or(default)
    }

    /// Union of all names reachable in frames and process scope.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for frame in &self.frames {
            for name in frame.vars.keys() {
                if !keys.iter().any(|k| k == name) {
                    keys.push(name.clone());
                }
            }
        }
        for name in self.scope.keys() {
            if !keys.iter().any(|k| k == name) {
                keys.push(name.clone());
            }
        }
        keys
    }

    /// Recursively expand templated strings against this context.
    ///
    /// Strings containing `{` are rendered as templates; lists and maps
    /// (keys included) are expanded recursively; everything else passes
    /// through unchanged.
    pub fn expand(&self, value: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::Str(s) if s.contains('{') => {
                Ok(Value::Str(template::render(s, self)?))
            }
            Value::List(items) => {
                let expanded: Result<Vec<Value>, TemplateError> =
                    items.iter().map(|v| self.expand(v)).collect();
                Ok(Value::List(expanded?))
            }
            Value::Map(map) => {
                let mut out = IndexMap::new();
                for (k, v) in map {
                    let key = if k.contains('{') {
                        template::render(k, self)?
                    } else {
                        k.clone()
                    };
                    out.insert(key, self.expand(v)?);
                }
                Ok(Value::Map(out))
            }
            other => Ok(other.clone()),
        }
    }

    pub fn expand_str(&self, s: &str) -> Result<String, TemplateError> {
        if s.contains('{') {
            template::render(s, self)
        } else {
            Ok(s.to_string())
        }
    }
}

impl Lookup for Context {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get_variable(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        let mut ctx = Context::new();
        ctx.set_variable("STR", Value::from("123"));
        ctx.set_variable("BYTES", Value::Bytes(b"123".to_vec()));
        ctx.set_variable("INT", Value::Int(123));
        ctx.set_variable("NONE", Value::Null);
        ctx.set_variable("ARRAY0", Value::List(vec![]));
        ctx.set_variable("ARRAY1", Value::List(vec![Value::from("123")]));
        ctx.set_variable(
            "ARRAY2",
            Value::List(vec![Value::from("123"), Value::from("456")]),
        );
        ctx.set_variable("DICT0", Value::Map(Value::map()));
        let mut d1 = Value::map();
        d1.insert("STR".to_string(), Value::from("123"));
        ctx.set_variable("DICT1", Value::Map(d1));
        ctx
    }

    fn expand(ctx: &Context, s: &str) -> String {
        match ctx.expand(&Value::from(s)).unwrap() {
            Value::Str(s) => s,
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn test_expand_scalars() {
        let ctx = ctx();
        assert_eq!(expand(&ctx, "aaabbb"), "aaabbb");
        assert_eq!(expand(&ctx, "aaa{{STR}}bbb"), "aaa123bbb");
        assert_eq!(expand(&ctx, "aaa{{BYTES}}bbb"), "aaa123bbb");
        assert_eq!(expand(&ctx, "aaa{{INT}}bbb"), "aaa123bbb");
        assert_eq!(expand(&ctx, "aaa{{NONE}}bbb"), "aaabbb");
    }

    #[test]
    fn test_expand_containers() {
        let ctx = ctx();
        assert_eq!(expand(&ctx, "aaa{{ARRAY0}}bbb"), "aaabbb");
        assert_eq!(expand(&ctx, "aaa{{ARRAY1}}bbb"), "aaa123bbb");
        assert_eq!(expand(&ctx, "aaa{{ARRAY2}}bbb"), "aaa[\"123\", \"456\"]bbb");
        assert_eq!(expand(&ctx, "aaa{{DICT0}}bbb"), "aaabbb");
        assert_eq!(expand(&ctx, "aaa{{DICT1}}bbb"), "aaa{\"STR\": \"123\"}bbb");
        assert_eq!(expand(&ctx, "aaa{{DICT1.STR}}bbb"), "aaa123bbb");
        assert_eq!(expand(&ctx, "aaa{{DICT1.MISSING}}bbb"), "aaabbb");
    }

    #[test]
    fn test_expand_missing_and_default() {
        let ctx = ctx();
        assert_eq!(expand(&ctx, "aaa{{MISSING}}bbb"), "aaabbb");
        assert_eq!(expand(&ctx, "aaa{{MISSING | default('123')}}bbb"), "aaa123bbb");
    }

    #[test]
    fn test_expand_list_and_map() {
        let ctx = ctx();
        let list = Value::List(vec![
            Value::from("aaa{{STR}}bbb"),
            Value::Int(123),
            Value::from("xx"),
        ]);
        assert_eq!(
            ctx.expand(&list).unwrap(),
            Value::List(vec![Value::from("aaa123bbb"), Value::Int(123), Value::from("xx")])
        );

        let mut map = Value::map();
        map.insert("a{{STR}}a".to_string(), Value::from("b{{STR}}b"));
        let expanded = ctx.expand(&Value::Map(map)).unwrap();
        let expanded = expanded.as_map().unwrap();
        assert_eq!(expanded.get("a123a"), Some(&Value::from("b123b")));
    }

    #[test]
    fn test_frames_shadow_and_pop() {
        let mut ctx = Context::new();
        ctx.set_variable("name", Value::from("outer"));
        ctx.push_frame("f1");
        ctx.push_variable("name", Value::from("inner"));
        assert_eq!(ctx.get_variable("name"), Some(&Value::from("inner")));
        ctx.pop_frame("f1").unwrap();
        assert_eq!(ctx.get_variable("name"), Some(&Value::from("outer")));
    }

    #[test]
    fn test_variable_stacks_are_lifo() {
        let mut ctx = Context::new();
        ctx.push_variable("v", Value::Int(1));
        ctx.push_variable("v", Value::Int(2));
        assert_eq!(ctx.get_variable("v"), Some(&Value::Int(2)));
        assert_eq!(ctx.pop_variable("v").unwrap(), Value::Int(2));
        assert_eq!(ctx.get_variable("v"), Some(&Value::Int(1)));
        assert_eq!(ctx.pop_variable("v").unwrap(), Value::Int(1));
        assert!(ctx.get_variable("v").is_none());
        assert!(ctx.pop_variable("v").is_err());
    }

    #[test]
    fn test_frame_misnest_is_error() {
        let mut ctx = Context::new();
        ctx.push_frame("a");
        ctx.push_frame("b");
        assert!(matches!(
            ctx.pop_frame("a"),
            Err(ContextError::FrameMisnest { .. })
        ));
        ctx.pop_frame("b").unwrap();
        ctx.pop_frame("a").unwrap();
        assert!(ctx.pop_frame("a").is_err());
    }

    #[test]
    fn test_keys_union() {
        let mut ctx = Context::new();
        ctx.set_variable("scope", Value::Int(1));
        ctx.push_frame("f");
        ctx.push_variable("framed", Value::Int(2));
        let keys = ctx.keys();
        assert!(keys.contains(&"scope".to_string()));
        assert!(keys.contains(&"framed".to_string()));
    }
}
