use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Files longer than this get intent-targeted context extraction instead
/// of being passed to the model whole.
pub const LARGE_FILE_LINES: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JavaMethod {
    pub name: String,
    pub return_type: String,
    /// (type, name) pairs in declaration order.
    pub parameters: Vec<(String, String)>,
    pub visibility: String,
}

impl JavaMethod {
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|(ty, name)| format!("{ty} {name}"))
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JavaField {
    pub name: String,
    pub field_type: String,
    pub visibility: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JavaTypeInfo {
    pub name: String,
    pub package: Option<String>,
    pub is_interface: bool,
    pub extends: Option<String>,
    pub implements: Vec<String>,
    pub methods: Vec<JavaMethod>,
    pub fields: Vec<JavaField>,
    pub imports: Vec<String>,
    pub annotations: Vec<String>,
}

fn package_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*package\s+([\w.]+)\s*;").unwrap())
}

fn type_decl_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^\s*(?:public\s+|final\s+|abstract\s+)*\s*(class|interface|enum)\s+(\w+)(?:\s+extends\s+([\w<>,\s.]+?))?(?:\s+implements\s+([\w<>,\s.]+?))?\s*\{",
        )
        .unwrap()
    })
}

fn method_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^\s*(public|private|protected)\s+(?:static\s+|final\s+|synchronized\s+)*([\w<>\[\],\s.]+?)\s+(\w+)\s*\(([^)]*)\)\s*(?:throws\s+[\w,\s.]+)?\s*\{",
        )
        .unwrap()
    })
}

fn field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^\s*(public|private|protected)\s+(?:static\s+|final\s+)*([\w<>\[\],.]+)\s+(\w+)\s*(?:=[^;]+)?;",
        )
        .unwrap()
    })
}

/// Extract import statements verbatim.
pub fn extract_imports(code: &str) -> Vec<String> {
    code.lines()
        .map(str::trim)
        .filter(|l| l.starts_with("import ") && l.ends_with(';'))
        .map(String::from)
        .collect()
}

/// Extract annotations (without arguments), skipping javadoc tags.
pub fn extract_annotations(code: &str) -> Vec<String> {
    code.lines()
        .map(str::trim)
        .filter(|l| l.starts_with('@') && !l.starts_with("@param") && !l.starts_with("@return"))
        .map(|l| l.split('(').next().unwrap_or(l).to_string())
        .collect()
}

/// Extract method signatures, declaration line only.
pub fn extract_method_signatures(code: &str) -> Vec<String> {
    method_re()
        .captures_iter(code)
        .map(|caps| {
            format!(
                "{} {} {}({})",
                &caps[1],
                caps[2].trim(),
                &caps[3],
                caps[4].trim()
            )
        })
        .collect()
}

/// Best-effort structural parse of a single Java source file. Returns
/// `None` when no type declaration is found.
pub fn parse_java_source(code: &str) -> Option<JavaTypeInfo> {
    let decl = type_decl_re().captures(code)?;
    let kind = &decl[1];
    let name = decl[2].to_string();

    let package = package_re()
        .captures(code)
        .map(|caps| caps[1].to_string());

    let (extends, implements) = if kind == "interface" {
        // Interfaces extend other interfaces; keep the first as parent.
        let parents: Vec<String> = decl
            .get(3)
            .map(|m| m.as_str().split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();
        (parents.first().cloned(), parents.into_iter().skip(1).collect())
    } else {
        (
            decl.get(3).map(|m| m.as_str().trim().to_string()),
            decl.get(4)
                .map(|m| m.as_str().split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
        )
    };

    let methods = method_re()
        .captures_iter(code)
        .filter(|caps| caps[2].trim() != "class")
        .map(|caps| JavaMethod {
            visibility: caps[1].to_string(),
            return_type: caps[2].trim().to_string(),
            name: caps[3].to_string(),
            parameters: parse_parameters(&caps[4]),
        })
        .collect();

    let fields = field_re()
        .captures_iter(code)
        .map(|caps| JavaField {
            visibility: caps[1].to_string(),
            field_type: caps[2].to_string(),
            name: caps[3].to_string(),
        })
        .collect();

    Some(JavaTypeInfo {
        name,
        package,
        is_interface: kind == "interface",
        extends,
        implements,
        methods,
        fields,
        imports: extract_imports(code),
        annotations: extract_annotations(code),
    })
}

fn parse_parameters(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| {
            let mut parts = p.rsplitn(2, char::is_whitespace);
            let name = parts.next()?.to_string();
            let ty = parts.next()?.trim().to_string();
            Some((ty, name))
        })
        .collect()
}

/// Reduce a large source file to the context relevant to an intent:
/// package, imports, the type declaration, all fields, and only the
/// methods whose names share a keyword with the intent. Other method
/// bodies are elided to signatures.
pub fn extract_relevant_context(code: &str, intent: &str) -> String {
    let Some(info) = parse_java_source(code) else {
        return code.to_string();
    };

    let keywords: Vec<String> = intent
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(String::from)
        .collect();

    let mut out = String::new();
    if let Some(package) = &info.package {
        out.push_str(&format!("package {package};\n\n"));
    }
    for import in &info.imports {
        out.push_str(import);
        out.push('\n');
    }
    out.push('\n');

    let kind = if info.is_interface { "interface" } else { "class" };
    out.push_str(&format!("public {kind} {} {{\n", info.name));
    for field in &info.fields {
        out.push_str(&format!(
            "    {} {} {};\n",
            field.visibility, field.field_type, field.name
        ));
    }
    out.push('\n');

    for method in &info.methods {
        let relevant = keywords
            .iter()
            .any(|kw| method.name.to_lowercase().contains(kw));
        if relevant {
            if let Some(body) = extract_method_body(code, &method.name) {
                out.push_str(&body);
                out.push('\n');
                continue;
            }
        }
        out.push_str(&format!(
            "    {} {} {}; // body elided\n",
            method.visibility,
            method.return_type,
            method.signature()
        ));
    }
    out.push_str("}\n");
    out
}

/// Pull one method's full text by brace matching from its declaration.
fn extract_method_body(code: &str, method_name: &str) -> Option<String> {
    let needle = format!("{method_name}(");
    let decl_start = code
        .lines()
        .scan(0usize, |offset, line| {
            let start = *offset;
            *offset += line.len() + 1;
            Some((start, line))
        })
        .find(|(_, line)| line.contains(&needle) && line.contains('{'))
        .map(|(start, _)| start)?;

    let bytes = code.as_bytes();
    let mut depth = 0i32;
    let mut started = false;
    for (i, &b) in bytes.iter().enumerate().skip(decl_start) {
        match b {
            b'{' => {
                depth += 1;
                started = true;
            }
            b'}' => {
                depth -= 1;
                if started && depth == 0 {
                    return Some(code[decl_start..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
