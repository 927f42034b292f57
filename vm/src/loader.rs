//! Textual `.zim` image loader.
//!
//! An image is a flat list of named bindings, each a self-describing
//! value: objects with named fields, arrays, strings, integers,
//! booleans and `$undef`, plus `@name` references between bindings.
//! References may point forward and may form cycles (basic blocks
//! branch backwards), so materialization runs in two passes: container
//! bindings first get empty shells, then every shell is filled with its
//! children resolved against the full binding table. The binding named
//! `exports` is the package object the loader hands back.
//!
//! ```text
//! # returns a constant
//! f_main = { num_params: 0, num_locals: 0, entry: @b0 };
//! b0 = { name: "entry", instrs: [ { op: "push", val: 777 }, { op: "ret" } ] };
//! exports = { main: @f_main };
//! ```

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use object::{Array, Value};

use crate::alloc;
use crate::VM;

/// Parse an image file and return its package object.
pub fn parse_file(vm: &mut VM, path: &Path) -> io::Result<Value> {
    let source = fs::read_to_string(path)?;
    let src_name = path.to_string_lossy().into_owned();
    parse_str(vm, &source, &src_name)
}

/// Parse an image from memory. `src_name` labels load errors.
pub fn parse_str(vm: &mut VM, source: &str, src_name: &str) -> io::Result<Value> {
    let bindings = Parser::new(source, src_name).parse_image()?;
    materialize(vm, &bindings, src_name)
}

// ── Syntax tree ────────────────────────────────────────────────────

#[derive(Debug)]
enum Node {
    Undef,
    True,
    False,
    Int(i64),
    Str(String),
    Ref(String),
    Object(Vec<(String, Node)>),
    Array(Vec<Node>),
}

// ── Parser ─────────────────────────────────────────────────────────

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
    src_name: &'a str,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, src_name: &'a str) -> Self {
        Self {
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
            src_name,
        }
    }

    fn error(&self, msg: impl AsRef<str>) -> io::Error {
        invalid_data(format!(
            "{}@{}:{} - {}",
            self.src_name,
            self.line,
            self.col,
            msg.as_ref()
        ))
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(byte)
    }

    /// Skip whitespace and `#` line comments.
    fn skip_ws(&mut self) {
        while let Some(byte) = self.peek() {
            match byte {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.bump();
                }
                b'#' => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn expect(&mut self, wanted: u8) -> io::Result<()> {
        match self.peek() {
            Some(byte) if byte == wanted => {
                self.bump();
                Ok(())
            }
            Some(byte) => Err(self.error(format!(
                "expected '{}', found '{}'",
                wanted as char, byte as char
            ))),
            None => Err(self.error(format!(
                "expected '{}', found end of input",
                wanted as char
            ))),
        }
    }

    fn parse_ident(&mut self) -> io::Result<String> {
        let start = self.pos;
        match self.peek() {
            Some(byte) if byte.is_ascii_alphabetic() || byte == b'_' => {
                self.bump();
            }
            _ => return Err(self.error("expected an identifier")),
        }
        while let Some(byte) = self.peek() {
            if byte.is_ascii_alphanumeric() || byte == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        // Identifier bytes are ASCII, checked above.
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn parse_int(&mut self) -> io::Result<Node> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.bump();
        }
        if !matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            return Err(self.error("expected a digit"));
        }
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.bump();
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])
            .expect("digits are ASCII");
        match text.parse::<i64>() {
            Ok(n) => Ok(Node::Int(n)),
            Err(_) => Err(self.error("integer literal out of range")),
        }
    }

    fn parse_string(&mut self) -> io::Result<Node> {
        self.expect(b'"')?;
        let mut content = Vec::new();
        loop {
            let Some(byte) = self.bump() else {
                return Err(self.error("unterminated string literal"));
            };
            match byte {
                b'"' => break,
                b'\\' => {
                    let Some(escape) = self.bump() else {
                        return Err(self.error("unterminated escape"));
                    };
                    match escape {
                        b'n' => content.push(b'\n'),
                        b't' => content.push(b'\t'),
                        b'r' => content.push(b'\r'),
                        b'\\' => content.push(b'\\'),
                        b'"' => content.push(b'"'),
                        b'0' => content.push(b'\0'),
                        other => {
                            return Err(self.error(format!(
                                "unknown escape '\\{}'",
                                other as char
                            )));
                        }
                    }
                }
                other => content.push(other),
            }
        }
        match String::from_utf8(content) {
            Ok(text) => Ok(Node::Str(text)),
            Err(_) => Err(self.error("string literal is not valid UTF-8")),
        }
    }

    fn parse_expr(&mut self) -> io::Result<Node> {
        self.skip_ws();
        match self.peek() {
            Some(b'$') => {
                self.bump();
                let keyword = self.parse_ident()?;
                match keyword.as_str() {
                    "undef" => Ok(Node::Undef),
                    "true" => Ok(Node::True),
                    "false" => Ok(Node::False),
                    other => {
                        Err(self.error(format!("unknown keyword \"${other}\"")))
                    }
                }
            }
            Some(b'@') => {
                self.bump();
                Ok(Node::Ref(self.parse_ident()?))
            }
            Some(b'{') => self.parse_object(),
            Some(b'[') => self.parse_array(),
            Some(b'"') => self.parse_string(),
            Some(b'-') => self.parse_int(),
            Some(byte) if byte.is_ascii_digit() => self.parse_int(),
            Some(byte) => {
                Err(self.error(format!("unexpected character '{}'", byte as char)))
            }
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn parse_object(&mut self) -> io::Result<Node> {
        self.expect(b'{')?;
        let mut fields = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.bump();
            return Ok(Node::Object(fields));
        }
        loop {
            self.skip_ws();
            let name = self.parse_ident()?;
            self.skip_ws();
            self.expect(b':')?;
            let value = self.parse_expr()?;
            fields.push((name, value));
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.bump();
                }
                Some(b'}') => {
                    self.bump();
                    return Ok(Node::Object(fields));
                }
                _ => return Err(self.error("expected ',' or '}' in object")),
            }
        }
    }

    fn parse_array(&mut self) -> io::Result<Node> {
        self.expect(b'[')?;
        let mut elems = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.bump();
            return Ok(Node::Array(elems));
        }
        loop {
            elems.push(self.parse_expr()?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.bump();
                }
                Some(b']') => {
                    self.bump();
                    return Ok(Node::Array(elems));
                }
                _ => return Err(self.error("expected ',' or ']' in array")),
            }
        }
    }

    fn parse_image(&mut self) -> io::Result<Vec<(String, Node)>> {
        let mut bindings: Vec<(String, Node)> = Vec::new();
        loop {
            self.skip_ws();
            if self.peek().is_none() {
                return Ok(bindings);
            }
            let name = self.parse_ident()?;
            if bindings.iter().any(|(existing, _)| *existing == name) {
                return Err(
                    self.error(format!("duplicate binding \"{name}\""))
                );
            }
            self.skip_ws();
            self.expect(b'=')?;
            let value = self.parse_expr()?;
            self.skip_ws();
            self.expect(b';')?;
            bindings.push((name, value));
        }
    }
}

// ── Materialization ────────────────────────────────────────────────

fn materialize(
    vm: &mut VM,
    bindings: &[(String, Node)],
    src_name: &str,
) -> io::Result<Value> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, (name, _)) in bindings.iter().enumerate() {
        index.insert(name.as_str(), i);
    }

    // Shell pass: containers get empty shells so references resolve
    // before any content exists; leaves evaluate immediately.
    let mut values = vec![Value::UNDEF; bindings.len()];
    for (i, (name, node)) in bindings.iter().enumerate() {
        values[i] = match node {
            Node::Object(fields) => {
                alloc::alloc_obj(&mut vm.heap, fields.len() as u32)
            }
            Node::Array(elems) => alloc::alloc_array(
                &mut vm.heap,
                elems.len() as u32,
                elems.len() as u32,
            ),
            Node::Ref(_) => {
                return Err(invalid_data(format!(
                    "{src_name} - binding \"{name}\" cannot be a bare \
                     reference"
                )));
            }
            leaf => eval_leaf(vm, leaf),
        };
    }

    // Fill pass: every binding now has a value, so children including
    // cyclic references can evaluate.
    for (i, (_, node)) in bindings.iter().enumerate() {
        match node {
            Node::Object(fields) => {
                fill_object(vm, values[i], fields, &index, &values, src_name)?;
            }
            Node::Array(elems) => {
                fill_array(vm, values[i], elems, &index, &values, src_name)?;
            }
            _ => {}
        }
    }

    let Some(&exports_idx) = index.get("exports") else {
        return Err(invalid_data(format!(
            "{src_name} - image has no exports object"
        )));
    };
    let exports = values[exports_idx];
    if !exports.is_object() {
        return Err(invalid_data(format!(
            "{src_name} - exports must be an object"
        )));
    }
    Ok(exports)
}

fn eval_leaf(vm: &mut VM, node: &Node) -> Value {
    match node {
        Node::Undef => Value::UNDEF,
        Node::True => Value::TRUE,
        Node::False => Value::FALSE,
        Node::Int(n) => Value::from_i64(*n),
        Node::Str(s) => alloc::intern(vm, s),
        _ => unreachable!("not a leaf node"),
    }
}

fn eval(
    vm: &mut VM,
    node: &Node,
    index: &HashMap<&str, usize>,
    values: &[Value],
    src_name: &str,
) -> io::Result<Value> {
    Ok(match node {
        Node::Undef | Node::True | Node::False | Node::Int(_)
        | Node::Str(_) => eval_leaf(vm, node),
        Node::Ref(name) => match index.get(name.as_str()) {
            Some(&i) => values[i],
            None => {
                return Err(invalid_data(format!(
                    "{src_name} - unknown reference @{name}"
                )));
            }
        },
        Node::Object(fields) => {
            let obj = alloc::alloc_obj(&mut vm.heap, fields.len() as u32);
            fill_object(vm, obj, fields, index, values, src_name)?;
            obj
        }
        Node::Array(elems) => {
            let arr = alloc::alloc_array(
                &mut vm.heap,
                elems.len() as u32,
                elems.len() as u32,
            );
            fill_array(vm, arr, elems, index, values, src_name)?;
            arr
        }
    })
}

fn fill_object(
    vm: &mut VM,
    obj: Value,
    fields: &[(String, Node)],
    index: &HashMap<&str, usize>,
    values: &[Value],
    src_name: &str,
) -> io::Result<()> {
    for (field, child) in fields {
        let val = eval(vm, child, index, values, src_name)?;
        let name_val = alloc::intern(vm, field);
        alloc::obj_set_field(&mut vm.heap, obj, name_val, val);
    }
    Ok(())
}

fn fill_array(
    vm: &mut VM,
    mut arr: Value,
    elems: &[Node],
    index: &HashMap<&str, usize>,
    values: &[Value],
    src_name: &str,
) -> io::Result<()> {
    for (i, child) in elems.iter().enumerate() {
        let val = eval(vm, child, index, values, src_name)?;
        let array = unsafe { arr.as_mut::<Array>() };
        unsafe { array.set_element(i as u32, val) };
    }
    Ok(())
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
