use std::{collections::BTreeMap, rc::Rc};

use crate::{
    compiler::OptLevel,
    error::{EvalError, EvalResult},
    loc::SourceLocation,
    machine::instruction::{Instruction, OpCode},
    types::TypeTag,
    value::{Value, ValueData},
};

/// Version stamp the compiler writes into every program. Programs only run on
/// the exact version that produced them.
#[must_use]
pub const fn combined_version() -> u32 {
    // major << 16 | minor << 8 | patch of the crate version
    (0 << 16) | (4 << 8) | 0
}

/// Shared handle to an immutable compiled program.
pub type ProgramPtr = Rc<Program>;

const IMAGE_TAG: &[u8; 4] = b".tsb";
const IMAGE_MAGIC: u32 = 0xCAFE_07EA;
const MAX_NAME_LEN: u64 = 32767;
/// Safety bound for the instruction count of loaded images (300 MiB worth of
/// in-memory instructions).
const MAX_INSTRUCTIONS: u64 = (300 << 20) / 112;
/// Safety bound for payload strings in loaded images.
const MAX_PAYLOAD_STRING: u64 = 10 << 20;

/// An immutable compiled program: the instruction vector, the optimization
/// level and compiler version it was built with, and a debug map from
/// instruction index to source location.
///
/// Programs can be persisted as a host-endian binary image. The image is not
/// portable across machines or versions; debug info is not part of it.
#[derive(Debug)]
pub struct Program {
    name: String,
    opt_level: OptLevel,
    compiler_version: u32,
    instructions: Vec<Instruction>,
    debug_info: BTreeMap<usize, SourceLocation>,
}

impl Program {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        opt_level: OptLevel,
        compiler_version: u32,
        instructions: Vec<Instruction>,
        debug_info: BTreeMap<usize, SourceLocation>,
    ) -> Self {
        Self {
            name: name.into(),
            opt_level,
            compiler_version,
            instructions,
            debug_info,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn opt_level(&self) -> OptLevel {
        self.opt_level
    }

    #[must_use]
    pub fn compiler_version(&self) -> u32 {
        self.compiler_version
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    #[must_use]
    pub fn has_debug_info(&self) -> bool {
        !self.debug_info.is_empty()
    }

    /// The source location recorded for exactly this instruction, if any.
    #[must_use]
    pub fn location_for(&self, instr: usize) -> Option<&SourceLocation> {
        self.debug_info.get(&instr)
    }

    /// Best matching debug info for an instruction index: the exact entry if
    /// present, otherwise the closest entry before it.
    #[must_use]
    pub fn best_matching_location(&self, instr: usize) -> SourceLocation {
        if instr > self.instructions.len() {
            return SourceLocation::default();
        }
        if let Some(loc) = self.debug_info.get(&instr) {
            return loc.clone();
        }
        if let Some((_, loc)) = self.debug_info.range(..instr).next_back() {
            return loc.clone();
        }
        // fall forward to the first entry as a hint, better than nothing
        self.debug_info
            .range(instr..)
            .next()
            .map(|(_, loc)| loc.clone())
            .unwrap_or_default()
    }

    // --- binary image -------------------------------------------------------

    /// Serializes the program into its binary image (host byte order).
    /// Payloads must be primitives or strings; composite payloads refuse.
    pub fn save(&self) -> EvalResult<Vec<u8>> {
        let mut out = Vec::with_capacity(64 + self.instructions.len() * 16);
        out.extend_from_slice(IMAGE_TAG);
        out.extend_from_slice(&IMAGE_MAGIC.to_ne_bytes());
        out.extend_from_slice(&self.compiler_version.to_ne_bytes());
        out.push(self.opt_level as u8);

        let name_len = self.name.len() as u64;
        if name_len > MAX_NAME_LEN {
            return Err(EvalError::runtime("program name is too long for the image format"));
        }
        out.extend_from_slice(&name_len.to_ne_bytes());
        out.extend_from_slice(self.name.as_bytes());

        out.extend_from_slice(&(self.instructions.len() as u64).to_ne_bytes());
        for instr in &self.instructions {
            out.extend_from_slice(&(instr.op as u32).to_ne_bytes());
            instr.payload.with_data(|data| {
                out.extend_from_slice(&(data.tag() as u32).to_ne_bytes());
                match data {
                    ValueData::NaV => Ok(()),
                    ValueData::Bool(v) => {
                        out.push(u8::from(*v));
                        Ok(())
                    }
                    ValueData::U8(v) => {
                        out.push(*v);
                        Ok(())
                    }
                    ValueData::I64(v) => {
                        out.extend_from_slice(&v.to_ne_bytes());
                        Ok(())
                    }
                    ValueData::U64(v) => {
                        out.extend_from_slice(&v.to_ne_bytes());
                        Ok(())
                    }
                    ValueData::F64(v) => {
                        out.extend_from_slice(&v.to_ne_bytes());
                        Ok(())
                    }
                    ValueData::String(s) => {
                        out.extend_from_slice(&(s.len() as u64).to_ne_bytes());
                        out.extend_from_slice(s.as_bytes());
                        Ok(())
                    }
                    _ => Err(EvalError::runtime(format!(
                        "instruction payload of type {} is not persistable",
                        data.tag()
                    ))),
                }
            })?;
        }
        Ok(out)
    }

    /// Loads a program from its binary image. With `header_only` the body is
    /// skipped and the returned program carries no instructions.
    pub fn load(content: &[u8], header_only: bool) -> EvalResult<Self> {
        let mut r = ImageReader::new(content);

        let tag = r.bytes(4)?;
        if tag != IMAGE_TAG {
            return Err(EvalError::runtime("not a .tsb image"));
        }
        let magic = r.u32()?;
        if magic != IMAGE_MAGIC {
            return Err(EvalError::runtime("wrong magic number"));
        }
        let version = r.u32()?;
        if version != combined_version() {
            return Err(EvalError::runtime(format!(
                "program was compiled by version {version:#x}, this runtime is {:#x}",
                combined_version()
            )));
        }
        let opt_level = OptLevel::try_from(r.u8()?)
            .map_err(|_| EvalError::runtime("unknown optimization level"))?;

        let name_len = r.u64()?;
        if name_len > MAX_NAME_LEN {
            return Err(EvalError::runtime("unexpected big value for program name length"));
        }
        let name = String::from_utf8(r.bytes(name_len as usize)?.to_vec())
            .map_err(|_| EvalError::runtime("program name is not valid UTF-8"))?;

        let mut instructions = Vec::new();
        if !header_only {
            let count = r.u64()?;
            if count > MAX_INSTRUCTIONS {
                return Err(EvalError::runtime(
                    "unexpected big value for program instruction count",
                ));
            }
            instructions.reserve(count as usize);
            for _ in 0..count {
                let op = OpCode::try_from(r.u32()?).map_err(|_| EvalError::runtime("unknown opcode"))?;
                let tag = TypeTag::try_from(r.u32()?)
                    .map_err(|_| EvalError::runtime("unknown payload type tag"))?;
                let payload = match tag {
                    TypeTag::NaV => Value::nav(),
                    TypeTag::Bool => Value::from(r.u8()? != 0),
                    TypeTag::U8 => Value::from(r.u8()?),
                    TypeTag::I64 => Value::from(i64::from_ne_bytes(r.array8()?)),
                    TypeTag::U64 => Value::from(u64::from_ne_bytes(r.array8()?)),
                    TypeTag::F64 => Value::from(f64::from_ne_bytes(r.array8()?)),
                    TypeTag::String => {
                        let len = r.u64()?;
                        if len > MAX_PAYLOAD_STRING {
                            return Err(EvalError::runtime(
                                "unexpected big value for payload string length",
                            ));
                        }
                        let s = String::from_utf8(r.bytes(len as usize)?.to_vec())
                            .map_err(|_| EvalError::runtime("payload string is not valid UTF-8"))?;
                        Value::from(s)
                    }
                    _ => return Err(EvalError::runtime("malformed image: unsupported payload tag")),
                };
                instructions.push(Instruction::new(op, payload));
            }
            if !r.at_end() {
                return Err(EvalError::runtime("malformed image: trailing bytes"));
            }
        }

        Ok(Self {
            name,
            opt_level,
            compiler_version: version,
            instructions,
            debug_info: BTreeMap::new(),
        })
    }
}

/// Bounds-checked cursor over an image buffer.
struct ImageReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ImageReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> EvalResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| EvalError::runtime("image is truncated"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> EvalResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> EvalResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> EvalResult<u64> {
        Ok(u64::from_ne_bytes(self.array8()?))
    }

    fn array8(&mut self) -> EvalResult<[u8; 8]> {
        let b = self.bytes(8)?;
        Ok([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Program {
        let instructions = vec![
            Instruction::new(OpCode::Push, Value::from(1i64)),
            Instruction::new(OpCode::Push, Value::from("hello")),
            Instruction::new(OpCode::Push, Value::from(2.5f64)),
            Instruction::new(OpCode::Push, Value::from(true)),
            Instruction::new(OpCode::Push, Value::from(7u8)),
            Instruction::new(OpCode::MakeTuple, Value::from(5u64)),
            Instruction::bare(OpCode::ProgramEnd),
        ];
        Program::new("sample", OptLevel::O0, combined_version(), instructions, BTreeMap::new())
    }

    #[test]
    fn image_roundtrip_preserves_observable_fields() {
        let prog = sample();
        let bytes = prog.save().unwrap();
        let loaded = Program::load(&bytes, false).unwrap();

        assert_eq!(loaded.name(), prog.name());
        assert_eq!(loaded.opt_level(), prog.opt_level());
        assert_eq!(loaded.compiler_version(), prog.compiler_version());
        assert_eq!(loaded.instructions(), prog.instructions());
    }

    #[test]
    fn header_only_load_skips_the_body() {
        let bytes = sample().save().unwrap();
        let loaded = Program::load(&bytes, true).unwrap();
        assert_eq!(loaded.name(), "sample");
        assert!(loaded.is_empty());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = sample().save().unwrap();
        bytes[4] ^= 0xff;
        let err = Program::load(&bytes, false).unwrap_err();
        assert!(err.message().contains("wrong magic number"));
    }

    #[test]
    fn truncated_image_is_rejected() {
        let bytes = sample().save().unwrap();
        assert!(Program::load(&bytes[..bytes.len() - 3], false).is_err());
        assert!(Program::load(&bytes[..10], false).is_err());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let prog = Program::new(
            "old",
            OptLevel::O0,
            combined_version() + 1,
            vec![Instruction::bare(OpCode::ProgramEnd)],
            BTreeMap::new(),
        );
        let bytes = prog.save().unwrap();
        assert!(Program::load(&bytes, false).is_err());
    }

    #[test]
    fn composite_payloads_refuse_to_persist() {
        let prog = Program::new(
            "bad",
            OptLevel::O0,
            combined_version(),
            vec![Instruction::new(
                OpCode::Push,
                Value::from(crate::tuple::Tuple::new()),
            )],
            BTreeMap::new(),
        );
        assert!(prog.save().is_err());
    }

    #[test]
    fn best_matching_location_falls_back_to_previous() {
        let mut debug = BTreeMap::new();
        debug.insert(0usize, SourceLocation::line(1));
        debug.insert(5usize, SourceLocation::line(9));
        let prog = Program::new(
            "dbg",
            OptLevel::O0,
            combined_version(),
            vec![Instruction::bare(OpCode::NoOp); 7],
            debug,
        );
        assert_eq!(prog.best_matching_location(5).start_line(), 9);
        assert_eq!(prog.best_matching_location(3).start_line(), 1);
        assert_eq!(prog.best_matching_location(6).start_line(), 9);
        assert!(!prog.best_matching_location(100).is_set());
    }
}
