// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Command mapping engine.
//!
//! Translates SCPI-style ASCII commands into backend operations using
//! ordered, regex-matched rule lists configured per device. MODBUS devices
//! map commands onto function-code actions with type-aware register
//! encoding; generic-regex devices map commands onto request/response text
//! templates.
//!
//! Rules are compiled once at configuration load. Compilation validates
//! every pattern and every `$N` / `${name}` capture reference so that a
//! malformed rule is a load-time error, never a runtime surprise.

use std::fmt;

use regex::{Captures, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::MappingError;

/// Matches `$N` and `${name}` substitution tokens in templates.
fn token_regex() -> Regex {
    // Infallible: the pattern is a literal.
    Regex::new(r"\$(\w+)|\$\{(\w+)\}").unwrap()
}

// =============================================================================
// MODBUS operations
// =============================================================================

/// The eight MODBUS operations exposed through mapping rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModbusOp {
    /// FC 0x01.
    ReadCoils,
    /// FC 0x02.
    ReadDiscreteInputs,
    /// FC 0x03.
    ReadHoldingRegisters,
    /// FC 0x04.
    ReadInputRegisters,
    /// FC 0x05.
    WriteSingleCoil,
    /// FC 0x06.
    WriteSingleRegister,
    /// FC 0x0F.
    WriteMultipleCoils,
    /// FC 0x10. Configured as `write_holding_registers`.
    #[serde(rename = "write_holding_registers")]
    WriteMultipleRegisters,
}

impl ModbusOp {
    /// Returns the MODBUS function code.
    pub fn function_code(self) -> u8 {
        match self {
            Self::ReadCoils => 0x01,
            Self::ReadDiscreteInputs => 0x02,
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleCoil => 0x05,
            Self::WriteSingleRegister => 0x06,
            Self::WriteMultipleCoils => 0x0F,
            Self::WriteMultipleRegisters => 0x10,
        }
    }

    /// Whether this operation reads registers.
    pub fn reads_registers(self) -> bool {
        matches!(self, Self::ReadHoldingRegisters | Self::ReadInputRegisters)
    }

    /// Whether this operation reads coils or discrete inputs.
    pub fn reads_bits(self) -> bool {
        matches!(self, Self::ReadCoils | Self::ReadDiscreteInputs)
    }

    /// Whether this operation writes to the device.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::WriteSingleCoil
                | Self::WriteSingleRegister
                | Self::WriteMultipleCoils
                | Self::WriteMultipleRegisters
        )
    }
}

impl fmt::Display for ModbusOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.function_code())
    }
}

// =============================================================================
// Register data types
// =============================================================================

/// Register encoding for mapped values.
///
/// The byte-order suffix of the 32-bit types selects the register word
/// order; registers themselves always travel big-endian on the wire, so
/// `_le` amounts to a word swap relative to `_be`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// One unsigned 16-bit register.
    Uint16,
    /// One signed 16-bit register (two's complement).
    Int16,
    /// Two registers, high word first.
    Uint32Be,
    /// Two registers, low word first.
    Uint32Le,
    /// Two registers, high word first, signed.
    Int32Be,
    /// Two registers, low word first, signed.
    Int32Le,
    /// IEEE-754 single, high word first.
    Float32Be,
    /// IEEE-754 single, low word first.
    Float32Le,
    /// One register holding 0 or 1.
    Bool,
    /// ASCII packed two characters per register, high byte first.
    String,
}

impl Default for DataType {
    fn default() -> Self {
        Self::Uint16
    }
}

impl DataType {
    /// Registers occupied by one value of this type, when fixed.
    ///
    /// `String` values occupy the rule's `count` registers instead.
    pub fn register_width(self) -> Option<u16> {
        match self {
            Self::Uint16 | Self::Int16 | Self::Bool => Some(1),
            Self::Uint32Be | Self::Uint32Le | Self::Int32Be | Self::Int32Le => Some(2),
            Self::Float32Be | Self::Float32Le => Some(2),
            Self::String => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Uint16 => "uint16",
            Self::Int16 => "int16",
            Self::Uint32Be => "uint32_be",
            Self::Uint32Le => "uint32_le",
            Self::Int32Be => "int32_be",
            Self::Int32Le => "int32_le",
            Self::Float32Be => "float32_be",
            Self::Float32Le => "float32_le",
            Self::Bool => "bool",
            Self::String => "string",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Scalar values
// =============================================================================

/// A value parsed from a command capture or decoded from registers.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Single-precision float (registers carry 32 bits at most).
    Float(f32),
    /// ASCII text.
    Text(String),
}

impl ScalarValue {
    /// Parses command text into a scalar, accepting `on`/`off`/`true`/`false`
    /// as booleans, then integers, then floats, falling back to text.
    pub fn parse(text: &str) -> Self {
        match text.to_ascii_lowercase().as_str() {
            "true" | "on" => return Self::Bool(true),
            "false" | "off" => return Self::Bool(false),
            _ => {}
        }
        if let Ok(i) = text.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = text.parse::<f32>() {
            return Self::Float(f);
        }
        Self::Text(text.to_string())
    }

    /// Formats the value as the ASCII reply payload (no terminator).
    ///
    /// Integers print base 10; floats print the shortest decimal that
    /// round-trips, always carrying a decimal point; booleans print `1`/`0`;
    /// text prints verbatim.
    pub fn format(&self) -> String {
        match self {
            Self::Bool(true) => "1".to_string(),
            Self::Bool(false) => "0".to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => format!("{:?}", f),
            Self::Text(t) => t.clone(),
        }
    }

    /// Divides a numeric value by `scale`, turning integers into floats.
    pub fn descale(self, scale: f64) -> Self {
        match self {
            Self::Int(i) => Self::Float((i as f64 / scale) as f32),
            Self::Float(f) => Self::Float((f as f64 / scale) as f32),
            other => other,
        }
    }
}

// =============================================================================
// Register codec
// =============================================================================

fn encode_error(value: impl fmt::Debug, data_type: DataType, message: &str) -> MappingError {
    MappingError::ValueEncoding {
        value: format!("{:?}", value),
        data_type: data_type.to_string(),
        message: message.to_string(),
    }
}

/// Encodes a scalar into register values according to `data_type`.
///
/// `count` bounds `String` packing (space-padded); other types ignore it.
pub fn encode_value(
    value: &ScalarValue,
    data_type: DataType,
    count: u16,
) -> Result<Vec<u16>, MappingError> {
    let as_i64 = |v: &ScalarValue| -> Option<i64> {
        match v {
            ScalarValue::Bool(b) => Some(i64::from(*b)),
            ScalarValue::Int(i) => Some(*i),
            ScalarValue::Float(f) => Some(f.round() as i64),
            ScalarValue::Text(t) => t.parse::<i64>().ok(),
        }
    };
    let as_f32 = |v: &ScalarValue| -> Option<f32> {
        match v {
            ScalarValue::Bool(b) => Some(f32::from(u8::from(*b))),
            ScalarValue::Int(i) => Some(*i as f32),
            ScalarValue::Float(f) => Some(*f),
            ScalarValue::Text(t) => t.parse::<f32>().ok(),
        }
    };

    match data_type {
        DataType::Uint16 => {
            let v = as_i64(value).ok_or_else(|| encode_error(value, data_type, "not numeric"))?;
            if !(0..=0xFFFF).contains(&v) {
                return Err(encode_error(value, data_type, "out of range [0, 65535]"));
            }
            Ok(vec![v as u16])
        }
        DataType::Int16 => {
            let v = as_i64(value).ok_or_else(|| encode_error(value, data_type, "not numeric"))?;
            if !(-32768..=32767).contains(&v) {
                return Err(encode_error(value, data_type, "out of range [-32768, 32767]"));
            }
            Ok(vec![v as i16 as u16])
        }
        DataType::Uint32Be | DataType::Uint32Le => {
            let v = as_i64(value).ok_or_else(|| encode_error(value, data_type, "not numeric"))?;
            if !(0..=0xFFFF_FFFF).contains(&v) {
                return Err(encode_error(value, data_type, "out of range [0, 4294967295]"));
            }
            Ok(split_u32(v as u32, data_type == DataType::Uint32Le))
        }
        DataType::Int32Be | DataType::Int32Le => {
            let v = as_i64(value).ok_or_else(|| encode_error(value, data_type, "not numeric"))?;
            if !(i64::from(i32::MIN)..=i64::from(i32::MAX)).contains(&v) {
                return Err(encode_error(value, data_type, "out of 32-bit range"));
            }
            Ok(split_u32(v as i32 as u32, data_type == DataType::Int32Le))
        }
        DataType::Float32Be | DataType::Float32Le => {
            let v = as_f32(value).ok_or_else(|| encode_error(value, data_type, "not numeric"))?;
            Ok(split_u32(v.to_bits(), data_type == DataType::Float32Le))
        }
        DataType::Bool => {
            let v = match value {
                ScalarValue::Bool(b) => *b,
                ScalarValue::Int(i) => *i != 0,
                ScalarValue::Float(f) => *f != 0.0,
                ScalarValue::Text(_) => {
                    return Err(encode_error(value, data_type, "not a boolean"));
                }
            };
            Ok(vec![u16::from(v)])
        }
        DataType::String => {
            let text = match value {
                ScalarValue::Text(t) => t.clone(),
                other => other.format(),
            };
            if !text.is_ascii() {
                return Err(encode_error(&text, data_type, "not ASCII"));
            }
            let width = count.max(1) as usize;
            if text.len() > width * 2 {
                return Err(encode_error(&text, data_type, "longer than count registers"));
            }
            let mut bytes = text.into_bytes();
            bytes.resize(width * 2, b' ');
            Ok(bytes
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect())
        }
    }
}

/// Decodes register values into a scalar according to `data_type`.
pub fn decode_registers(registers: &[u16], data_type: DataType) -> Result<ScalarValue, MappingError> {
    let short = || MappingError::ValueDecoding {
        count: registers.len(),
        data_type: data_type.to_string(),
    };

    match data_type {
        DataType::Uint16 => registers
            .first()
            .map(|&r| ScalarValue::Int(i64::from(r)))
            .ok_or_else(short),
        DataType::Int16 => registers
            .first()
            .map(|&r| ScalarValue::Int(i64::from(r as i16)))
            .ok_or_else(short),
        DataType::Uint32Be | DataType::Uint32Le => {
            let v = join_u32(registers, data_type == DataType::Uint32Le).ok_or_else(short)?;
            Ok(ScalarValue::Int(i64::from(v)))
        }
        DataType::Int32Be | DataType::Int32Le => {
            let v = join_u32(registers, data_type == DataType::Int32Le).ok_or_else(short)?;
            Ok(ScalarValue::Int(i64::from(v as i32)))
        }
        DataType::Float32Be | DataType::Float32Le => {
            let v = join_u32(registers, data_type == DataType::Float32Le).ok_or_else(short)?;
            Ok(ScalarValue::Float(f32::from_bits(v)))
        }
        DataType::Bool => registers
            .first()
            .map(|&r| ScalarValue::Bool(r != 0))
            .ok_or_else(short),
        DataType::String => {
            let mut bytes = Vec::with_capacity(registers.len() * 2);
            for &reg in registers {
                bytes.extend_from_slice(&reg.to_be_bytes());
            }
            while matches!(bytes.last(), Some(b' ') | Some(0)) {
                bytes.pop();
            }
            let text = String::from_utf8_lossy(&bytes).into_owned();
            Ok(ScalarValue::Text(text))
        }
    }
}

fn split_u32(v: u32, low_word_first: bool) -> Vec<u16> {
    let hi = (v >> 16) as u16;
    let lo = v as u16;
    if low_word_first {
        vec![lo, hi]
    } else {
        vec![hi, lo]
    }
}

fn join_u32(registers: &[u16], low_word_first: bool) -> Option<u32> {
    if registers.len() < 2 {
        return None;
    }
    let (hi, lo) = if low_word_first {
        (registers[1], registers[0])
    } else {
        (registers[0], registers[1])
    };
    Some((u32::from(hi) << 16) | u32::from(lo))
}

// =============================================================================
// MODBUS rule specification
// =============================================================================

/// One MODBUS mapping rule as described by the configuration.
///
/// Either `action` or `response` must be present; a rule carrying `response`
/// answers statically without any device I/O.
#[derive(Debug, Clone, Default)]
pub struct ModbusRuleSpec {
    /// Command-matching regex (full match, case-insensitive).
    pub pattern: String,
    /// The MODBUS operation, absent for static-response rules.
    pub action: Option<ModbusOp>,
    /// Starting register/coil address.
    pub address: Option<u16>,
    /// Register/coil count (default 1).
    pub count: Option<u16>,
    /// Register encoding (default `uint16`).
    pub data_type: Option<DataType>,
    /// Write value: a literal or a `$N` capture reference.
    pub value: Option<String>,
    /// Multiply a numeric write value before encoding.
    pub scale: Option<f64>,
    /// Divide the decoded read value before formatting.
    pub response_scale: Option<f64>,
    /// Static reply with capture substitution; bypasses device I/O.
    pub response: Option<String>,
}

/// A translated MODBUS operation, ready for PDU encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusAction {
    /// The operation.
    pub op: ModbusOp,
    /// Starting address.
    pub address: u16,
    /// Register/coil count.
    pub count: u16,
    /// Encoded register values for register writes.
    pub values: Vec<u16>,
    /// Coil states for coil writes.
    pub coils: Vec<bool>,
    /// Declared register encoding for reads.
    pub data_type: DataType,
    /// Optional divisor applied to the decoded read value.
    pub response_scale: Option<f64>,
}

/// The outcome of translating one command.
#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    /// The rule answers statically; stage this text for the next read.
    Static(String),
    /// Execute this MODBUS operation on the device.
    Action(ModbusAction),
}

struct CompiledModbusRule {
    pattern: Regex,
    spec: ModbusRuleSpec,
}

/// An ordered, compiled MODBUS rule list for one device.
pub struct ModbusRuleSet {
    rules: Vec<CompiledModbusRule>,
    tokens: Regex,
}

impl fmt::Debug for ModbusRuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusRuleSet")
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl ModbusRuleSet {
    /// Compiles and validates an ordered rule list.
    ///
    /// Patterns compile case-insensitively. Every `$N`/`${name}` reference in
    /// `value` and `response` templates is checked against the pattern's
    /// capture groups.
    pub fn compile(specs: Vec<ModbusRuleSpec>) -> Result<Self, MappingError> {
        let tokens = token_regex();
        let mut rules = Vec::with_capacity(specs.len());

        for (index, spec) in specs.into_iter().enumerate() {
            if spec.pattern.is_empty() {
                return Err(MappingError::InvalidRule {
                    index,
                    message: "missing 'pattern'".into(),
                });
            }
            let pattern = RegexBuilder::new(&spec.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| MappingError::InvalidPattern {
                    index,
                    message: e.to_string(),
                })?;

            if let Some(template) = &spec.response {
                validate_tokens(&tokens, &pattern, template, index, "response")?;
            } else {
                let action = spec.action.ok_or_else(|| MappingError::InvalidRule {
                    index,
                    message: "missing 'action'".into(),
                })?;
                if spec.address.is_none() {
                    return Err(MappingError::InvalidRule {
                        index,
                        message: "missing 'address' in params".into(),
                    });
                }
                if action.is_write() {
                    let value = spec.value.as_deref().ok_or_else(|| MappingError::InvalidRule {
                        index,
                        message: "write action missing 'value' in params".into(),
                    })?;
                    validate_tokens(&tokens, &pattern, value, index, "value")?;
                }
            }

            rules.push(CompiledModbusRule { pattern, spec });
        }

        Ok(Self { rules, tokens })
    }

    /// Returns the number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if the set holds no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Translates a command into a MODBUS action or static response.
    ///
    /// Rules are evaluated top to bottom; the first full match wins.
    pub fn translate(&self, command: &str) -> Result<Translation, MappingError> {
        let command = command.trim();

        for rule in &self.rules {
            let captures = match full_match(&rule.pattern, command) {
                Some(c) => c,
                None => continue,
            };

            if let Some(template) = &rule.spec.response {
                let text = substitute(&self.tokens, template, &captures);
                return Ok(Translation::Static(text));
            }

            // compile() guarantees action and address are present here
            let op = rule.spec.action.ok_or_else(|| MappingError::InvalidRule {
                index: 0,
                message: "rule lost its action".into(),
            })?;
            let address = rule.spec.address.unwrap_or(0);
            let data_type = rule.spec.data_type.unwrap_or_default();
            let mut count = rule
                .spec
                .count
                .unwrap_or_else(|| data_type.register_width().unwrap_or(1));

            let mut values = Vec::new();
            let mut coils = Vec::new();

            if op.is_write() {
                let template = rule.spec.value.as_deref().unwrap_or_default();
                let raw = substitute(&self.tokens, template, &captures);

                match op {
                    ModbusOp::WriteSingleCoil => {
                        let v = ScalarValue::parse(&raw);
                        let on = match v {
                            ScalarValue::Bool(b) => b,
                            ScalarValue::Int(i) => i != 0,
                            ScalarValue::Float(f) => f != 0.0,
                            ScalarValue::Text(t) => {
                                return Err(encode_error(&t, DataType::Bool, "not a boolean"));
                            }
                        };
                        coils.push(on);
                        count = 1;
                    }
                    ModbusOp::WriteMultipleCoils => {
                        for c in raw.trim().chars() {
                            match c {
                                '1' => coils.push(true),
                                '0' => coils.push(false),
                                other => {
                                    return Err(encode_error(
                                        other,
                                        DataType::Bool,
                                        "coil values must be a string of 0/1 digits",
                                    ));
                                }
                            }
                        }
                        if coils.is_empty() {
                            return Err(encode_error(&raw, DataType::Bool, "empty coil string"));
                        }
                        count = coils.len() as u16;
                    }
                    _ => {
                        let mut scalar = ScalarValue::parse(&raw);
                        if let Some(scale) = rule.spec.scale {
                            scalar = match scalar {
                                ScalarValue::Int(i) => {
                                    ScalarValue::Int((i as f64 * scale).round() as i64)
                                }
                                ScalarValue::Float(f) => {
                                    ScalarValue::Int((f as f64 * scale).round() as i64)
                                }
                                other => other,
                            };
                        }
                        values = encode_value(&scalar, data_type, count)?;
                        if op == ModbusOp::WriteMultipleRegisters {
                            count = values.len() as u16;
                        }
                    }
                }
            }

            return Ok(Translation::Action(ModbusAction {
                op,
                address,
                count,
                values,
                coils,
                data_type,
                response_scale: rule.spec.response_scale,
            }));
        }

        Err(MappingError::NoRuleMatched {
            command: command.to_string(),
        })
    }
}

// =============================================================================
// Generic regex rules
// =============================================================================

/// One generic-regex mapping rule as described by the configuration.
#[derive(Debug, Clone, Default)]
pub struct GenericRuleSpec {
    /// Command-matching regex.
    pub pattern: String,
    /// Wire request template with capture substitution.
    pub request_format: Option<String>,
    /// Whether a wire response is expected after the request.
    pub expects_response: bool,
    /// Regex the (terminator-stripped) wire response must fullmatch.
    pub response_regex: Option<String>,
    /// ASCII reply template rendered from the response match.
    pub response_format: Option<String>,
    /// Static reply with capture substitution; bypasses device I/O.
    pub response: Option<String>,
    /// Zero-pad width for scaled request numbers.
    pub payload_width: Option<usize>,
    /// Multiply request numbers before rendering.
    pub scale: Option<f64>,
    /// Divide response numbers before rendering.
    pub response_scale: Option<f64>,
    /// Response terminator or device prompt (default newline).
    pub terminator: Option<String>,
}

/// A compiled generic-regex rule.
pub struct GenericRule {
    pattern: Regex,
    request_format: String,
    /// Whether this rule reads a wire response back.
    pub expects_response: bool,
    response_pattern: Option<Regex>,
    response_format: Option<String>,
    static_response: Option<String>,
    /// Zero-pad width applied to scaled request numbers.
    pub payload_width: Option<usize>,
    scale: Option<f64>,
    response_scale: Option<f64>,
    /// Response terminator, when framing is line/prompt based.
    pub terminator: Option<String>,
}

impl fmt::Debug for GenericRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericRule")
            .field("pattern", &self.pattern.as_str())
            .field("expects_response", &self.expects_response)
            .finish()
    }
}

/// An ordered, compiled generic-regex rule list for one device.
pub struct GenericRuleSet {
    rules: Vec<GenericRule>,
    tokens: Regex,
}

impl fmt::Debug for GenericRuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericRuleSet")
            .field("rules", &self.rules.len())
            .finish()
    }
}

/// The rendered wire exchange for one generic command.
#[derive(Debug)]
pub enum GenericExchange<'a> {
    /// Stage this text without touching the wire.
    Static(String),
    /// Send the request; optionally parse a response with the same rule.
    Request {
        /// The rendered wire request.
        payload: String,
        /// The rule to parse the response with, when one is expected.
        rule: &'a GenericRule,
    },
}

impl GenericRuleSet {
    /// Compiles and validates an ordered rule list.
    pub fn compile(specs: Vec<GenericRuleSpec>) -> Result<Self, MappingError> {
        if specs.is_empty() {
            return Err(MappingError::InvalidRule {
                index: 0,
                message: "generic-regex devices need at least one rule".into(),
            });
        }

        let tokens = token_regex();
        let mut rules = Vec::with_capacity(specs.len());

        for (index, spec) in specs.into_iter().enumerate() {
            if spec.pattern.is_empty() {
                return Err(MappingError::InvalidRule {
                    index,
                    message: "missing 'pattern'".into(),
                });
            }
            let pattern =
                Regex::new(&spec.pattern).map_err(|e| MappingError::InvalidPattern {
                    index,
                    message: e.to_string(),
                })?;

            if let Some(template) = &spec.response {
                validate_tokens(&tokens, &pattern, template, index, "response")?;
                rules.push(GenericRule {
                    pattern,
                    request_format: String::new(),
                    expects_response: false,
                    response_pattern: None,
                    response_format: None,
                    static_response: Some(template.clone()),
                    payload_width: spec.payload_width,
                    scale: spec.scale,
                    response_scale: spec.response_scale,
                    terminator: None,
                });
                continue;
            }

            let request_format =
                spec.request_format
                    .clone()
                    .ok_or_else(|| MappingError::InvalidRule {
                        index,
                        message: "missing 'request_format'".into(),
                    })?;
            validate_tokens(&tokens, &pattern, &request_format, index, "request_format")?;

            let mut response_pattern = None;
            let mut response_format = None;
            let mut payload_width = spec.payload_width;

            if spec.expects_response {
                let regex_text =
                    spec.response_regex
                        .as_deref()
                        .ok_or_else(|| MappingError::InvalidRule {
                            index,
                            message: "expects a response but missing 'response_regex'".into(),
                        })?;
                let compiled =
                    Regex::new(regex_text).map_err(|e| MappingError::InvalidPattern {
                        index,
                        message: e.to_string(),
                    })?;
                let format =
                    spec.response_format
                        .clone()
                        .ok_or_else(|| MappingError::InvalidRule {
                            index,
                            message: "expects a response but missing 'response_format'".into(),
                        })?;
                validate_tokens(&tokens, &compiled, &format, index, "response_format")?;

                if payload_width.is_none() {
                    payload_width = infer_payload_width(regex_text);
                }

                response_pattern = Some(compiled);
                response_format = Some(format);
            }

            // A scaled numeric payload defaults to five digits when nothing
            // narrower can be inferred.
            if payload_width.is_none() && spec.scale.is_some() {
                payload_width = Some(5);
            }

            rules.push(GenericRule {
                pattern,
                request_format,
                expects_response: spec.expects_response,
                response_pattern,
                response_format,
                static_response: None,
                payload_width,
                scale: spec.scale,
                response_scale: spec.response_scale,
                terminator: if spec.expects_response {
                    Some(spec.terminator.unwrap_or_else(|| "\n".to_string()))
                } else {
                    None
                },
            });
        }

        Ok(Self { rules, tokens })
    }

    /// Matches a command and renders its wire request.
    pub fn prepare(&self, command: &str) -> Result<GenericExchange<'_>, MappingError> {
        let command = command.trim();
        for rule in &self.rules {
            let captures = match full_match(&rule.pattern, command) {
                Some(c) => c,
                None => continue,
            };

            if let Some(template) = &rule.static_response {
                return Ok(GenericExchange::Static(substitute(
                    &self.tokens,
                    template,
                    &captures,
                )));
            }

            let payload = render_scaled(
                &self.tokens,
                &rule.request_format,
                &captures,
                rule.scale,
                rule.payload_width,
            )?;
            return Ok(GenericExchange::Request { payload, rule });
        }

        Err(MappingError::NoRuleMatched {
            command: command.to_string(),
        })
    }
}

impl GenericRule {
    /// Parses a wire response and renders the ASCII reply.
    ///
    /// The (terminator-stripped) response must fullmatch `response_regex`.
    pub fn render_response(&self, wire: &str) -> Result<String, MappingError> {
        let pattern = self.response_pattern.as_ref().ok_or_else(|| {
            MappingError::InvalidRule {
                index: 0,
                message: "rule expects no response".into(),
            }
        })?;
        let format = self.response_format.as_deref().unwrap_or_default();

        let candidate = wire.trim_end_matches(['\r', '\n']);
        let captures = full_match(pattern, candidate).ok_or_else(|| MappingError::NoRuleMatched {
            command: candidate.to_string(),
        })?;

        let tokens = token_regex();
        if let Some(scale) = self.response_scale {
            return Ok(render_descale(&tokens, format, &captures, scale));
        }
        Ok(substitute(&tokens, format, &captures))
    }
}

/// Extracts the width of a `(?P<payload>\d{N})` group, when present.
fn infer_payload_width(response_regex: &str) -> Option<usize> {
    let finder = Regex::new(r"\(\?P<payload>\\d\{(\d+)\}\)").ok()?;
    finder
        .captures(response_regex)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

// =============================================================================
// Template helpers
// =============================================================================

fn full_match<'t>(pattern: &Regex, text: &'t str) -> Option<Captures<'t>> {
    let captures = pattern.captures(text)?;
    // Anchored semantics: the whole command must be consumed.
    let whole = captures.get(0)?;
    if whole.start() == 0 && whole.end() == text.len() {
        Some(captures)
    } else {
        None
    }
}

fn lookup<'t>(captures: &Captures<'t>, key: &str) -> Option<&'t str> {
    if let Ok(index) = key.parse::<usize>() {
        captures.get(index).map(|m| m.as_str())
    } else {
        captures.name(key).map(|m| m.as_str())
    }
}

fn substitute(tokens: &Regex, template: &str, captures: &Captures<'_>) -> String {
    tokens
        .replace_all(template, |m: &Captures<'_>| {
            let key = m.get(1).or_else(|| m.get(2)).map(|g| g.as_str()).unwrap_or("");
            lookup(captures, key).unwrap_or("").to_string()
        })
        .into_owned()
}

fn render_scaled(
    tokens: &Regex,
    template: &str,
    captures: &Captures<'_>,
    scale: Option<f64>,
    width: Option<usize>,
) -> Result<String, MappingError> {
    let mut failure = None;
    let rendered = tokens.replace_all(template, |m: &Captures<'_>| {
        let key = m.get(1).or_else(|| m.get(2)).map(|g| g.as_str()).unwrap_or("");
        let value = lookup(captures, key).unwrap_or("");
        match scale {
            Some(scale) => match value.parse::<f64>() {
                Ok(f) => {
                    let scaled = (f * scale).round() as i64;
                    match width {
                        Some(w) => format!("{:0width$}", scaled, width = w),
                        None => scaled.to_string(),
                    }
                }
                Err(_) => {
                    failure = Some(MappingError::ValueEncoding {
                        value: value.to_string(),
                        data_type: "number".into(),
                        message: "cannot scale a non-numeric capture".into(),
                    });
                    String::new()
                }
            },
            None => value.to_string(),
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(rendered.into_owned()),
    }
}

fn render_descale(tokens: &Regex, template: &str, captures: &Captures<'_>, scale: f64) -> String {
    // Fixed decimals when the divisor is a power of ten (e.g. 100 -> 2).
    let decimals = {
        let log = scale.log10();
        if scale > 0.0 && (log - log.round()).abs() < 1e-9 {
            Some(log.round() as usize)
        } else {
            None
        }
    };
    tokens
        .replace_all(template, |m: &Captures<'_>| {
            let key = m.get(1).or_else(|| m.get(2)).map(|g| g.as_str()).unwrap_or("");
            let value = lookup(captures, key).unwrap_or("");
            let numeric = value
                .find(|c: char| c == '-' || c.is_ascii_digit())
                .map(|start| {
                    let tail: String = value[start..]
                        .chars()
                        .take_while(|c| *c == '-' || c.is_ascii_digit())
                        .collect();
                    tail
                })
                .and_then(|s| s.parse::<i64>().ok());
            match numeric {
                Some(i) => {
                    let scaled = i as f64 / scale;
                    match decimals {
                        Some(d) => format!("{:.prec$}", scaled, prec = d),
                        None => scaled.to_string(),
                    }
                }
                None => value.to_string(),
            }
        })
        .into_owned()
}

fn validate_tokens(
    tokens: &Regex,
    pattern: &Regex,
    template: &str,
    index: usize,
    field: &'static str,
) -> Result<(), MappingError> {
    let names: Vec<&str> = pattern.capture_names().flatten().collect();
    for m in tokens.captures_iter(template) {
        let key = m.get(1).or_else(|| m.get(2)).map(|g| g.as_str()).unwrap_or("");
        if let Ok(number) = key.parse::<usize>() {
            if number >= pattern.captures_len() {
                return Err(MappingError::UnknownCaptureGroup {
                    index,
                    field,
                    group: key.to_string(),
                });
            }
        } else if !names.contains(&key) {
            return Err(MappingError::UnknownCaptureGroup {
                index,
                field,
                group: key.to_string(),
            });
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
