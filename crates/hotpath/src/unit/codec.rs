use super::{
    CodeUnit, Const, FORMAT_VERSION, Frame, Handler, Instruction, LineEntry, MAGIC, Method, Op,
    UnitError, opcode,
};
use std::collections::HashMap;

type Result<T> = std::result::Result<T, UnitError>;

const TAG_UTF8: u8 = 1;
const TAG_INT: u8 = 2;

/// Bounds-checked big-endian cursor.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let remaining = self.data.len() - self.pos;
        if remaining < n {
            return Err(UnitError::Truncated {
                offset: self.pos,
                needed: n - remaining,
            });
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_be_bytes(raw))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Constant pool, 1-based like the encoded indices.
struct Pool {
    entries: Vec<Const>,
}

impl Pool {
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let count = reader.u16()?;
        let mut entries = Vec::with_capacity(usize::from(count));
        for i in 0..count {
            let index = i + 1;
            match reader.u8()? {
                TAG_UTF8 => {
                    let len = reader.u16()?;
                    let bytes = reader.take(usize::from(len))?;
                    let text =
                        std::str::from_utf8(bytes).map_err(|_| UnitError::BadUtf8(index))?;
                    entries.push(Const::Str(text.to_string()));
                }
                TAG_INT => entries.push(Const::Int(reader.i64()?)),
                tag => return Err(UnitError::BadPoolTag(tag)),
            }
        }
        Ok(Pool { entries })
    }

    fn get(&self, index: u16) -> Result<&Const> {
        if index == 0 {
            return Err(UnitError::BadPoolIndex(index));
        }
        self.entries
            .get(usize::from(index) - 1)
            .ok_or(UnitError::BadPoolIndex(index))
    }

    fn utf8(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Const::Str(s) => Ok(s.as_str()),
            Const::Int(_) => Err(UnitError::PoolKind {
                index,
                expected: "a UTF-8 entry",
            }),
        }
    }
}

fn read_header(reader: &mut Reader<'_>) -> Result<(Pool, String)> {
    let magic = reader.take(4)?;
    if magic != MAGIC {
        let mut got = [0u8; 4];
        got.copy_from_slice(magic);
        return Err(UnitError::BadMagic(got));
    }
    let version = reader.u16()?;
    if version != FORMAT_VERSION {
        return Err(UnitError::UnsupportedVersion(version));
    }
    let pool = Pool::read(reader)?;
    let name = pool.utf8(reader.u16()?)?.to_string();
    Ok((pool, name))
}

/// Read just the unit's name, without decoding any method.
pub fn peek_name(data: &[u8]) -> Result<String> {
    let mut reader = Reader::new(data);
    read_header(&mut reader).map(|(_, name)| name)
}

/// Parse and validate a complete unit.
pub fn decode(data: &[u8]) -> Result<CodeUnit> {
    let mut reader = Reader::new(data);
    let (pool, name) = read_header(&mut reader)?;

    let source = match reader.u16()? {
        0 => None,
        index => Some(pool.utf8(index)?.to_string()),
    };

    let method_count = reader.u16()?;
    let mut methods = Vec::with_capacity(usize::from(method_count));
    for _ in 0..method_count {
        methods.push(read_method(&mut reader, &pool)?);
    }

    if reader.remaining() > 0 {
        return Err(UnitError::TrailingBytes(reader.remaining()));
    }

    Ok(CodeUnit {
        name,
        source,
        methods,
    })
}

fn read_method(reader: &mut Reader<'_>, pool: &Pool) -> Result<Method> {
    let name = pool.utf8(reader.u16()?)?.to_string();
    let params = reader.u8()?;
    let max_stack = reader.u16()?;
    let max_locals = reader.u16()?;

    let code_len = reader.u32()? as usize;
    let code = read_code(reader.take(code_len)?, pool)?;

    let mut handlers = Vec::new();
    for _ in 0..reader.u16()? {
        handlers.push(Handler {
            start: reader.u32()?,
            end: reader.u32()?,
            target: reader.u32()?,
        });
    }

    let mut lines = Vec::new();
    for _ in 0..reader.u16()? {
        lines.push(LineEntry {
            start: reader.u32()?,
            line: reader.u32()?,
        });
    }

    let mut frames = Vec::new();
    for _ in 0..reader.u16()? {
        frames.push(Frame {
            pc: reader.u32()?,
            depth: reader.u16()?,
        });
    }

    let method = Method {
        name,
        params,
        max_stack,
        max_locals,
        code,
        handlers,
        lines,
        frames,
    };
    check_targets(&method)?;
    Ok(method)
}

fn read_code(bytes: &[u8], pool: &Pool) -> Result<Vec<Instruction>> {
    let mut reader = Reader::new(bytes);
    let mut code = Vec::new();

    while reader.remaining() > 0 {
        let pc = reader.pos as u32;
        let op = match reader.u8()? {
            opcode::NOP => Op::Nop,
            opcode::PUSH => Op::Push(pool.get(reader.u16()?)?.clone()),
            opcode::LOAD => Op::Load(reader.u16()?),
            opcode::STORE => Op::Store(reader.u16()?),
            opcode::ADD => Op::Add,
            opcode::SUB => Op::Sub,
            opcode::MUL => Op::Mul,
            opcode::LT => Op::Lt,
            opcode::DUP => Op::Dup,
            opcode::POP => Op::Pop,
            opcode::GOTO => Op::Goto(reader.u32()?),
            opcode::IFZ => Op::IfZero(reader.u32()?),
            opcode::IFNZ => Op::IfNonZero(reader.u32()?),
            opcode::INVOKE => Op::Invoke {
                owner: pool.utf8(reader.u16()?)?.to_string(),
                name: pool.utf8(reader.u16()?)?.to_string(),
                argc: reader.u8()?,
                returns: reader.u8()? != 0,
            },
            opcode::THROW => Op::Throw,
            opcode::RETURN => Op::Return,
            opcode::RETURN_VOID => Op::ReturnVoid,
            other => return Err(UnitError::UnknownOpcode { opcode: other, pc }),
        };
        code.push(Instruction { pc, op });
    }

    Ok(code)
}

/// Every pc referenced by the method must start an instruction. Handler ends
/// and line starts may also sit at the end of the code.
fn check_targets(method: &Method) -> Result<()> {
    let code_len = method.code_len();
    let on_boundary = |pc: u32| method.index_of(pc).is_some();
    let check = |what: &'static str, pc: u32, end_ok: bool| {
        if on_boundary(pc) || (end_ok && pc == code_len) {
            Ok(())
        } else {
            Err(UnitError::BadTarget { what, pc })
        }
    };

    for insn in &method.code {
        if let Some(&target) = insn.op.target() {
            check("branch", target, false)?;
        }
    }
    for handler in &method.handlers {
        check("handler start", handler.start, false)?;
        check("handler end", handler.end, true)?;
        check("handler target", handler.target, false)?;
    }
    for entry in &method.lines {
        check("line", entry.start, true)?;
    }
    for frame in &method.frames {
        check("frame", frame.pc, false)?;
    }
    Ok(())
}

/// Interns constants in first-use order.
#[derive(Default)]
struct PoolWriter {
    entries: Vec<Const>,
    index: HashMap<Const, u16>,
}

impl PoolWriter {
    fn intern(&mut self, value: Const) -> Result<u16> {
        if let Some(&index) = self.index.get(&value) {
            return Ok(index);
        }
        let index = u16::try_from(self.entries.len() + 1).map_err(|_| UnitError::TooMany {
            what: "constant pool entries",
            limit: usize::from(u16::MAX),
        })?;
        self.entries.push(value.clone());
        self.index.insert(value, index);
        Ok(index)
    }

    fn utf8(&mut self, text: &str) -> Result<u16> {
        self.intern(Const::Str(text.to_string()))
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        put_u16(out, self.entries.len() as u16);
        for entry in &self.entries {
            match entry {
                Const::Str(text) => {
                    out.push(TAG_UTF8);
                    put_u16(out, count(text.len(), "bytes in a UTF-8 constant")?);
                    out.extend_from_slice(text.as_bytes());
                }
                Const::Int(value) => {
                    out.push(TAG_INT);
                    out.extend_from_slice(&value.to_be_bytes());
                }
            }
        }
        Ok(())
    }
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn count(len: usize, what: &'static str) -> Result<u16> {
    u16::try_from(len).map_err(|_| UnitError::TooMany {
        what,
        limit: usize::from(u16::MAX),
    })
}

/// Serialize a unit. The constant pool is rebuilt from scratch.
pub fn encode(unit: &CodeUnit) -> Result<Vec<u8>> {
    let mut pool = PoolWriter::default();
    let mut body = Vec::new();

    put_u16(&mut body, pool.utf8(&unit.name)?);
    match &unit.source {
        Some(source) => put_u16(&mut body, pool.utf8(source)?),
        None => put_u16(&mut body, 0),
    }
    put_u16(&mut body, count(unit.methods.len(), "methods")?);

    for method in &unit.methods {
        write_method(&mut body, &mut pool, method)?;
    }

    let mut out = Vec::with_capacity(body.len() + 64);
    out.extend_from_slice(&MAGIC);
    put_u16(&mut out, FORMAT_VERSION);
    pool.write(&mut out)?;
    out.extend_from_slice(&body);
    Ok(out)
}

fn write_method(out: &mut Vec<u8>, pool: &mut PoolWriter, method: &Method) -> Result<()> {
    put_u16(out, pool.utf8(&method.name)?);
    out.push(method.params);
    put_u16(out, method.max_stack);
    put_u16(out, method.max_locals);

    let mut code = Vec::new();
    for insn in &method.code {
        code.push(insn.op.opcode());
        match &insn.op {
            Op::Push(value) => put_u16(&mut code, pool.intern(value.clone())?),
            Op::Load(slot) | Op::Store(slot) => put_u16(&mut code, *slot),
            Op::Goto(target) | Op::IfZero(target) | Op::IfNonZero(target) => {
                put_u32(&mut code, *target)
            }
            Op::Invoke {
                owner,
                name,
                argc,
                returns,
            } => {
                put_u16(&mut code, pool.utf8(owner)?);
                put_u16(&mut code, pool.utf8(name)?);
                code.push(*argc);
                code.push(u8::from(*returns));
            }
            _ => {}
        }
    }
    let code_len = u32::try_from(code.len()).map_err(|_| UnitError::TooMany {
        what: "code bytes",
        limit: u32::MAX as usize,
    })?;
    put_u32(out, code_len);
    out.extend_from_slice(&code);

    put_u16(out, count(method.handlers.len(), "handlers")?);
    for handler in &method.handlers {
        put_u32(out, handler.start);
        put_u32(out, handler.end);
        put_u32(out, handler.target);
    }

    put_u16(out, count(method.lines.len(), "line entries")?);
    for entry in &method.lines {
        put_u32(out, entry.start);
        put_u32(out, entry.line);
    }

    put_u16(out, count(method.frames.len(), "frames")?);
    for frame in &method.frames {
        put_u32(out, frame.pc);
        put_u16(out, frame.depth);
    }
    Ok(())
}
