//! Byte-level encoding and decoding of unit files.
//!
//! All integers are big-endian; strings are a `u16` length followed by UTF-8.
//! Code bodies address branch targets by byte offset on disk and by [`Label`]
//! in memory: decoding assigns one label per distinct target offset, and
//! encoding resolves labels back to offsets.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeSet, HashMap};

use crate::format::{
    AccessFlags, Code, Field, Frame, Handler, Method, UnitFile, UnitHeader, VType, UNIT_MAGIC,
    UNIT_VERSION,
};
use crate::insn::{opcode, Insn, Label, MemberRef, ValueKind};

// =============================================================================
// Reader / Writer
// =============================================================================

pub struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                anyhow!(
                    "unexpected end of input: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.bytes.len().saturating_sub(self.pos)
                )
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(i64::from_be_bytes(buf))
    }

    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).context("invalid UTF-8 in string")
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }
}

#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_str(&mut self, s: &str) -> Result<()> {
        let len = u16::try_from(s.len())
            .map_err(|_| anyhow!("string too long to encode ({} bytes)", s.len()))?;
        self.write_u16(len);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

fn write_count(w: &mut ByteWriter, n: usize, what: &str) -> Result<()> {
    let n = u16::try_from(n).map_err(|_| anyhow!("too many {} ({})", what, n))?;
    w.write_u16(n);
    Ok(())
}

// =============================================================================
// Header
// =============================================================================

/// Read only the header of a unit, leaving fields and methods untouched.
pub fn read_header(bytes: &[u8]) -> Result<UnitHeader> {
    let mut r = ByteReader::new(bytes);
    read_header_from(&mut r)
}

fn read_header_from(r: &mut ByteReader<'_>) -> Result<UnitHeader> {
    let magic = r.read_u32().context("reading magic")?;
    if magic != UNIT_MAGIC {
        bail!("bad magic 0x{:08x}", magic);
    }
    let version = r.read_u16()?;
    if version != UNIT_VERSION {
        bail!("unsupported unit version {}", version);
    }
    let access = AccessFlags(r.read_u16()?);
    let name = r.read_str().context("reading unit name")?;
    let super_name = r.read_str()?;
    let super_name = if super_name.is_empty() {
        None
    } else {
        Some(super_name)
    };
    let n = r.read_u16()?;
    let interfaces = (0..n)
        .map(|_| r.read_str())
        .collect::<Result<Vec<_>>>()
        .context("reading interfaces")?;
    Ok(UnitHeader {
        access,
        name,
        super_name,
        interfaces,
    })
}

fn write_header(w: &mut ByteWriter, header: &UnitHeader) -> Result<()> {
    w.write_u32(UNIT_MAGIC);
    w.write_u16(UNIT_VERSION);
    w.write_u16(header.access.0);
    w.write_str(&header.name)?;
    w.write_str(header.super_name.as_deref().unwrap_or(""))?;
    write_count(w, header.interfaces.len(), "interfaces")?;
    for iface in &header.interfaces {
        w.write_str(iface)?;
    }
    Ok(())
}

// =============================================================================
// Unit
// =============================================================================

pub fn decode_unit(bytes: &[u8]) -> Result<UnitFile> {
    let mut r = ByteReader::new(bytes);
    let header = read_header_from(&mut r)?;

    let n = r.read_u16()?;
    let mut fields = Vec::with_capacity(n as usize);
    for _ in 0..n {
        fields.push(Field {
            access: AccessFlags(r.read_u16()?),
            name: r.read_str()?,
            descriptor: r.read_str()?,
        });
    }

    let n = r.read_u16()?;
    let mut methods = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let access = AccessFlags(r.read_u16()?);
        let name = r.read_str()?;
        let descriptor = r.read_str()?;
        let code = match r.read_u8()? {
            0 => None,
            1 => Some(
                read_code(&mut r)
                    .with_context(|| format!("decoding {}.{}{}", header.name, name, descriptor))?,
            ),
            other => bail!("invalid code marker {} for method {}", other, name),
        };
        methods.push(Method {
            access,
            name,
            descriptor,
            code,
        });
    }

    if !r.is_empty() {
        bail!(
            "{} trailing bytes after unit {}",
            bytes.len() - r.position(),
            header.name
        );
    }

    Ok(UnitFile {
        header,
        fields,
        methods,
    })
}

pub fn encode_unit(unit: &UnitFile) -> Result<Vec<u8>> {
    let mut w = ByteWriter::new();
    write_header(&mut w, &unit.header)?;

    write_count(&mut w, unit.fields.len(), "fields")?;
    for field in &unit.fields {
        w.write_u16(field.access.0);
        w.write_str(&field.name)?;
        w.write_str(&field.descriptor)?;
    }

    write_count(&mut w, unit.methods.len(), "methods")?;
    for method in &unit.methods {
        w.write_u16(method.access.0);
        w.write_str(&method.name)?;
        w.write_str(&method.descriptor)?;
        match &method.code {
            None => w.write_u8(0),
            Some(code) => {
                w.write_u8(1);
                write_code(&mut w, code).with_context(|| {
                    format!(
                        "encoding {}.{}{}",
                        unit.header.name, method.name, method.descriptor
                    )
                })?;
            }
        }
    }
    Ok(w.into_bytes())
}

// =============================================================================
// Code
// =============================================================================

fn read_vtype(r: &mut ByteReader<'_>) -> Result<VType> {
    Ok(match r.read_u8()? {
        0 => VType::Top,
        1 => VType::Int,
        2 => VType::Long,
        3 => VType::Null,
        4 => VType::Ref(r.read_str()?),
        other => bail!("unknown verification type tag {}", other),
    })
}

fn write_vtype(w: &mut ByteWriter, vt: &VType) -> Result<()> {
    match vt {
        VType::Top => w.write_u8(0),
        VType::Int => w.write_u8(1),
        VType::Long => w.write_u8(2),
        VType::Null => w.write_u8(3),
        VType::Ref(name) => {
            w.write_u8(4);
            w.write_str(name)?;
        }
    }
    Ok(())
}

fn read_member(r: &mut ByteReader<'_>) -> Result<MemberRef> {
    Ok(MemberRef {
        owner: r.read_str()?,
        name: r.read_str()?,
        descriptor: r.read_str()?,
    })
}

/// Decode one instruction. Branch targets come back as `Label(byte_offset)`
/// and are renumbered by [`read_code`].
fn read_insn(r: &mut ByteReader<'_>) -> Result<Insn> {
    let op = r.read_u8()?;
    let insn = match op {
        opcode::NOP => Insn::Nop,
        opcode::ACONST_NULL => Insn::PushNull,
        opcode::ICONST => Insn::PushInt(r.read_i32()?),
        opcode::LCONST => Insn::PushLong(r.read_i64()?),
        opcode::SCONST => Insn::PushStr(r.read_str()?),
        opcode::ILOAD => Insn::Load(ValueKind::Int, r.read_u16()?),
        opcode::LLOAD => Insn::Load(ValueKind::Long, r.read_u16()?),
        opcode::ALOAD => Insn::Load(ValueKind::Ref, r.read_u16()?),
        opcode::ISTORE => Insn::Store(ValueKind::Int, r.read_u16()?),
        opcode::LSTORE => Insn::Store(ValueKind::Long, r.read_u16()?),
        opcode::ASTORE => Insn::Store(ValueKind::Ref, r.read_u16()?),
        opcode::POP => Insn::Pop,
        opcode::DUP => Insn::Dup,
        opcode::SWAP => Insn::Swap,
        opcode::IADD => Insn::IAdd,
        opcode::ISUB => Insn::ISub,
        opcode::LADD => Insn::LAdd,
        opcode::LSUB => Insn::LSub,
        opcode::GOTO => Insn::Goto(Label(r.read_u32()?)),
        opcode::IFEQ => Insn::IfEq(Label(r.read_u32()?)),
        opcode::IFNE => Insn::IfNe(Label(r.read_u32()?)),
        opcode::IFNULL => Insn::IfNull(Label(r.read_u32()?)),
        opcode::IFNONNULL => Insn::IfNonNull(Label(r.read_u32()?)),
        opcode::IF_ICMPLT => Insn::IfICmpLt(Label(r.read_u32()?)),
        opcode::NEW => Insn::New(r.read_str()?),
        opcode::GETFIELD => Insn::GetField(read_member(r)?),
        opcode::PUTFIELD => Insn::PutField(read_member(r)?),
        opcode::GETSTATIC => Insn::GetStatic(read_member(r)?),
        opcode::PUTSTATIC => Insn::PutStatic(read_member(r)?),
        opcode::NEWARRAY => Insn::NewArray(r.read_str()?),
        opcode::ARRAYLENGTH => Insn::ArrayLength,
        opcode::AALOAD => Insn::ArrayLoad,
        opcode::AASTORE => Insn::ArrayStore,
        opcode::INVOKESTATIC => Insn::InvokeStatic(read_member(r)?),
        opcode::INVOKEVIRTUAL => Insn::InvokeVirtual(read_member(r)?),
        opcode::RETURN => Insn::Return(None),
        opcode::IRETURN => Insn::Return(Some(ValueKind::Int)),
        opcode::LRETURN => Insn::Return(Some(ValueKind::Long)),
        opcode::ARETURN => Insn::Return(Some(ValueKind::Ref)),
        opcode::THROW => Insn::Throw,
        other => bail!("unknown opcode 0x{:02x}", other),
    };
    Ok(insn)
}

fn read_code(r: &mut ByteReader<'_>) -> Result<Code> {
    let max_stack = r.read_u16()?;
    let max_locals = r.read_u16()?;
    let len = r.read_u32()? as usize;
    let raw = r.read_bytes(len)?;

    let mut decoded: Vec<(u32, Insn)> = Vec::new();
    let mut cr = ByteReader::new(raw);
    while !cr.is_empty() {
        let offset = cr.position() as u32;
        let insn = read_insn(&mut cr).with_context(|| format!("at code offset {}", offset))?;
        decoded.push((offset, insn));
    }

    let n = r.read_u16()?;
    let mut raw_handlers = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let start = r.read_u32()?;
        let end = r.read_u32()?;
        let handler = r.read_u32()?;
        let catch_type = r.read_str()?;
        raw_handlers.push((start, end, handler, catch_type));
    }

    let n = r.read_u16()?;
    let mut raw_frames = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let offset = r.read_u32()?;
        let nl = r.read_u16()?;
        let locals = (0..nl)
            .map(|_| read_vtype(r))
            .collect::<Result<Vec<_>>>()?;
        let ns = r.read_u16()?;
        let stack = (0..ns)
            .map(|_| read_vtype(r))
            .collect::<Result<Vec<_>>>()?;
        raw_frames.push((offset, locals, stack));
    }

    // Every referenced offset gets a label, numbered in offset order.
    let mut targets: BTreeSet<u32> = BTreeSet::new();
    targets.extend(decoded.iter().filter_map(|(_, i)| i.branch_target().map(|l| l.0)));
    for (start, end, handler, _) in &raw_handlers {
        targets.extend([*start, *end, *handler]);
    }
    targets.extend(raw_frames.iter().map(|(offset, _, _)| *offset));

    let boundaries: BTreeSet<u32> = decoded
        .iter()
        .map(|(offset, _)| *offset)
        .chain(std::iter::once(len as u32))
        .collect();
    if let Some(bad) = targets.iter().find(|t| !boundaries.contains(t)) {
        bail!("offset {} is not an instruction boundary", bad);
    }
    let labels: HashMap<u32, Label> = targets
        .iter()
        .enumerate()
        .map(|(i, offset)| (*offset, Label(i as u32)))
        .collect();
    let label_at = |offset: u32| -> Label { labels[&offset] };

    let mut insns = Vec::with_capacity(decoded.len() + labels.len());
    for (offset, insn) in decoded {
        if let Some(l) = labels.get(&offset) {
            insns.push(Insn::Label(*l));
        }
        insns.push(relabel(insn, &label_at));
    }
    if let Some(l) = labels.get(&(len as u32)) {
        insns.push(Insn::Label(*l));
    }

    let handlers = raw_handlers
        .into_iter()
        .map(|(start, end, handler, catch_type)| Handler {
            start: label_at(start),
            end: label_at(end),
            handler: label_at(handler),
            catch_type: if catch_type.is_empty() {
                None
            } else {
                Some(catch_type)
            },
        })
        .collect();
    let frames = raw_frames
        .into_iter()
        .map(|(offset, locals, stack)| Frame {
            label: label_at(offset),
            locals,
            stack,
        })
        .collect();

    Ok(Code {
        max_stack,
        max_locals,
        insns,
        handlers,
        frames,
    })
}

fn relabel(insn: Insn, label_at: &impl Fn(u32) -> Label) -> Insn {
    match insn {
        Insn::Goto(l) => Insn::Goto(label_at(l.0)),
        Insn::IfEq(l) => Insn::IfEq(label_at(l.0)),
        Insn::IfNe(l) => Insn::IfNe(label_at(l.0)),
        Insn::IfNull(l) => Insn::IfNull(label_at(l.0)),
        Insn::IfNonNull(l) => Insn::IfNonNull(label_at(l.0)),
        Insn::IfICmpLt(l) => Insn::IfICmpLt(label_at(l.0)),
        other => other,
    }
}

fn member_size(m: &MemberRef) -> usize {
    6 + m.owner.len() + m.name.len() + m.descriptor.len()
}

/// Encoded size in bytes; labels occupy none.
pub fn insn_size(insn: &Insn) -> usize {
    match insn {
        Insn::Label(_) => 0,
        Insn::PushInt(_) => 5,
        Insn::PushLong(_) => 9,
        Insn::PushStr(s) | Insn::New(s) | Insn::NewArray(s) => 3 + s.len(),
        Insn::Load(..) | Insn::Store(..) => 3,
        Insn::Goto(_)
        | Insn::IfEq(_)
        | Insn::IfNe(_)
        | Insn::IfNull(_)
        | Insn::IfNonNull(_)
        | Insn::IfICmpLt(_) => 5,
        Insn::GetField(m)
        | Insn::PutField(m)
        | Insn::GetStatic(m)
        | Insn::PutStatic(m)
        | Insn::InvokeStatic(m)
        | Insn::InvokeVirtual(m) => 1 + member_size(m),
        _ => 1,
    }
}

/// Byte offset of every label in `insns`.
pub fn label_offsets(insns: &[Insn]) -> HashMap<Label, u32> {
    let mut offsets = HashMap::new();
    let mut offset = 0u32;
    for insn in insns {
        if let Insn::Label(l) = insn {
            offsets.insert(*l, offset);
        }
        offset += insn_size(insn) as u32;
    }
    offsets
}

fn write_member(w: &mut ByteWriter, m: &MemberRef) -> Result<()> {
    w.write_str(&m.owner)?;
    w.write_str(&m.name)?;
    w.write_str(&m.descriptor)
}

fn write_insn(w: &mut ByteWriter, insn: &Insn, offset_of: &impl Fn(Label) -> Result<u32>) -> Result<()> {
    let kind_op = |k: &ValueKind, int: u8, long: u8, reference: u8| match k {
        ValueKind::Int => int,
        ValueKind::Long => long,
        ValueKind::Ref => reference,
    };
    match insn {
        Insn::Label(_) => {}
        Insn::Nop => w.write_u8(opcode::NOP),
        Insn::PushNull => w.write_u8(opcode::ACONST_NULL),
        Insn::PushInt(v) => {
            w.write_u8(opcode::ICONST);
            w.write_i32(*v);
        }
        Insn::PushLong(v) => {
            w.write_u8(opcode::LCONST);
            w.write_i64(*v);
        }
        Insn::PushStr(s) => {
            w.write_u8(opcode::SCONST);
            w.write_str(s)?;
        }
        Insn::Load(k, slot) => {
            w.write_u8(kind_op(k, opcode::ILOAD, opcode::LLOAD, opcode::ALOAD));
            w.write_u16(*slot);
        }
        Insn::Store(k, slot) => {
            w.write_u8(kind_op(k, opcode::ISTORE, opcode::LSTORE, opcode::ASTORE));
            w.write_u16(*slot);
        }
        Insn::Pop => w.write_u8(opcode::POP),
        Insn::Dup => w.write_u8(opcode::DUP),
        Insn::Swap => w.write_u8(opcode::SWAP),
        Insn::IAdd => w.write_u8(opcode::IADD),
        Insn::ISub => w.write_u8(opcode::ISUB),
        Insn::LAdd => w.write_u8(opcode::LADD),
        Insn::LSub => w.write_u8(opcode::LSUB),
        Insn::Goto(l)
        | Insn::IfEq(l)
        | Insn::IfNe(l)
        | Insn::IfNull(l)
        | Insn::IfNonNull(l)
        | Insn::IfICmpLt(l) => {
            let op = match insn {
                Insn::Goto(_) => opcode::GOTO,
                Insn::IfEq(_) => opcode::IFEQ,
                Insn::IfNe(_) => opcode::IFNE,
                Insn::IfNull(_) => opcode::IFNULL,
                Insn::IfNonNull(_) => opcode::IFNONNULL,
                _ => opcode::IF_ICMPLT,
            };
            w.write_u8(op);
            w.write_u32(offset_of(*l)?);
        }
        Insn::New(c) => {
            w.write_u8(opcode::NEW);
            w.write_str(c)?;
        }
        Insn::GetField(m) => {
            w.write_u8(opcode::GETFIELD);
            write_member(w, m)?;
        }
        Insn::PutField(m) => {
            w.write_u8(opcode::PUTFIELD);
            write_member(w, m)?;
        }
        Insn::GetStatic(m) => {
            w.write_u8(opcode::GETSTATIC);
            write_member(w, m)?;
        }
        Insn::PutStatic(m) => {
            w.write_u8(opcode::PUTSTATIC);
            write_member(w, m)?;
        }
        Insn::NewArray(d) => {
            w.write_u8(opcode::NEWARRAY);
            w.write_str(d)?;
        }
        Insn::ArrayLength => w.write_u8(opcode::ARRAYLENGTH),
        Insn::ArrayLoad => w.write_u8(opcode::AALOAD),
        Insn::ArrayStore => w.write_u8(opcode::AASTORE),
        Insn::InvokeStatic(m) => {
            w.write_u8(opcode::INVOKESTATIC);
            write_member(w, m)?;
        }
        Insn::InvokeVirtual(m) => {
            w.write_u8(opcode::INVOKEVIRTUAL);
            write_member(w, m)?;
        }
        Insn::Return(None) => w.write_u8(opcode::RETURN),
        Insn::Return(Some(k)) => {
            w.write_u8(kind_op(k, opcode::IRETURN, opcode::LRETURN, opcode::ARETURN))
        }
        Insn::Throw => w.write_u8(opcode::THROW),
    }
    Ok(())
}

fn write_code(w: &mut ByteWriter, code: &Code) -> Result<()> {
    let offsets = label_offsets(&code.insns);
    let offset_of = |l: Label| -> Result<u32> {
        offsets
            .get(&l)
            .copied()
            .ok_or_else(|| anyhow!("label {} is referenced but never placed", l))
    };

    let mut body = ByteWriter::new();
    for insn in &code.insns {
        write_insn(&mut body, insn, &offset_of)?;
    }

    w.write_u16(code.max_stack);
    w.write_u16(code.max_locals);
    w.write_u32(body.len() as u32);
    w.write_bytes(&body.into_bytes());

    write_count(w, code.handlers.len(), "handlers")?;
    for h in &code.handlers {
        w.write_u32(offset_of(h.start)?);
        w.write_u32(offset_of(h.end)?);
        w.write_u32(offset_of(h.handler)?);
        w.write_str(h.catch_type.as_deref().unwrap_or(""))?;
    }

    write_count(w, code.frames.len(), "frames")?;
    for frame in &code.frames {
        w.write_u32(offset_of(frame.label)?);
        write_count(w, frame.locals.len(), "frame locals")?;
        for vt in &frame.locals {
            write_vtype(w, vt)?;
        }
        write_count(w, frame.stack.len(), "frame stack entries")?;
        for vt in &frame.stack {
            write_vtype(w, vt)?;
        }
    }
    Ok(())
}
