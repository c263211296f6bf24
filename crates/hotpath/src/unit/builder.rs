//! Programmatic unit assembly, used by tests, examples and anyone producing
//! units without a compiler. Stack metadata is always derived, never written
//! by hand.

use super::events::{Event, Label, MethodEvents, lower};
use super::{CodeUnit, Handler, Method, Op, UnitError, encode};

#[derive(Debug, Clone)]
pub struct MethodBuilder {
    events: MethodEvents,
}

impl MethodBuilder {
    pub fn new(name: impl Into<String>, params: u8) -> Self {
        MethodBuilder {
            events: MethodEvents::new(name, params, u16::from(params)),
        }
    }

    /// Reserve local slots beyond the parameters.
    pub fn locals(&mut self, max_locals: u16) -> &mut Self {
        self.events.max_locals = max_locals.max(u16::from(self.events.params));
        self
    }

    pub fn new_label(&mut self) -> Label {
        self.events.new_label()
    }

    pub fn label(&mut self, label: Label) -> &mut Self {
        self.events.events.push(Event::Label(label));
        self
    }

    pub fn line(&mut self, line: u32, start: Label) -> &mut Self {
        self.events.events.push(Event::Line { line, start });
        self
    }

    /// Place a fresh label here and start `line` at it.
    pub fn line_here(&mut self, line: u32) -> &mut Self {
        let start = self.new_label();
        self.label(start).line(line, start)
    }

    pub fn op(&mut self, op: Op<Label>) -> &mut Self {
        self.events.events.push(Event::Insn(op));
        self
    }

    pub fn handler(&mut self, start: Label, end: Label, target: Label) -> &mut Self {
        self.events.handlers.push(Handler { start, end, target });
        self
    }

    pub fn build(&self) -> Result<Method, UnitError> {
        lower(&self.events)
    }
}

#[derive(Debug, Clone)]
pub struct UnitBuilder {
    name: String,
    source: Option<String>,
    methods: Vec<MethodBuilder>,
}

impl UnitBuilder {
    /// `name` uses the internal `/`-separated form.
    pub fn new(name: impl Into<String>) -> Self {
        UnitBuilder {
            name: name.into(),
            source: None,
            methods: Vec::new(),
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn method(mut self, method: MethodBuilder) -> Self {
        self.methods.push(method);
        self
    }

    pub fn build(&self) -> Result<CodeUnit, UnitError> {
        Ok(CodeUnit {
            name: self.name.clone(),
            source: self.source.clone(),
            methods: self
                .methods
                .iter()
                .map(MethodBuilder::build)
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn build_bytes(&self) -> Result<Vec<u8>, UnitError> {
        encode(&self.build()?)
    }
}
