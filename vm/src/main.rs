use clap::Parser as ClapParser;
use std::path::{Path, PathBuf};
use std::process;

use heap::HeapSettings;
use object::{Str, Tag, Value};
use vm::{codeheap, interp, loader, VM};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Image files to execute in order
    #[arg(required = true, help = "The .zim image files to execute")]
    files: Vec<String>,

    /// Run entry functions on the code-heap executor instead of the
    /// tree-walking interpreter
    #[arg(long)]
    compiled: bool,

    /// Additional package search directory (repeatable)
    #[arg(long, value_name = "DIR")]
    pkg_path: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let mut vm = VM::new(HeapSettings::default());
    for dir in &cli.pkg_path {
        vm.pkg_dirs.push(PathBuf::from(dir));
    }

    for filename in &cli.files {
        let pkg = match loader::parse_file(&mut vm, Path::new(filename)) {
            Ok(pkg) => pkg,
            Err(err) => {
                eprintln!("Error loading image '{}': {}", filename, err);
                process::exit(1);
            }
        };

        let result = if cli.compiled {
            codeheap::call_export_fn(&mut vm, pkg, "main", &[])
        } else {
            interp::call_export_fn(&mut vm, pkg, "main", &[])
        };

        match result {
            Ok(value) => println!("{}", format_value(value)),
            Err(err) => {
                eprintln!("Error executing {}: {}", filename, err);
                process::exit(1);
            }
        }
    }
}

fn format_value(value: Value) -> String {
    match value.tag() {
        Tag::Undef => "undef".to_string(),
        Tag::Bool => unsafe { value.as_bool() }.to_string(),
        Tag::Int64 => unsafe { value.as_i64() }.to_string(),
        Tag::String => {
            let s: &Str = unsafe { value.as_ref() };
            String::from_utf8_lossy(unsafe { s.bytes() }).into_owned()
        }
        Tag::Array => "<array>".to_string(),
        Tag::Object => "<object>".to_string(),
        Tag::HostFn => "<hostfn>".to_string(),
        Tag::RetAddr => "<retaddr>".to_string(),
    }
}
