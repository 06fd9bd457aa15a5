//! Tree-sitter chunking for languages with a bundled grammar.
//!
//! Each language carries a static [`LanguageSpec`]: the node kinds that count
//! as definitions, how to read a definition's name, and whether decorators
//! are folded into the chunk. The walk visits every node, so nested
//! definitions (methods inside classes) produce their own chunks.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::{debug, error};
use tree_sitter::{Language, Node, Parser, Tree};

use super::{line_count, ChunkMetadata, ChunkType, Chunker, ChunkerError, ParagraphChunker, RawChunk};

/// Languages the structural chunker has grammars for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AstLanguage {
    Python,
    JavaScript,
    TypeScript,
    Tsx,
    Go,
    Rust,
}

#[derive(Debug, Clone, Copy)]
enum NameRule {
    Python,
    Script,
    Go,
    Rust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoratorRule {
    None,
    /// Start the chunk at a wrapping `decorated_definition`, so every
    /// stacked decorator is part of it.
    DecoratedDefinition,
}

struct LanguageSpec {
    definitions: &'static [&'static str],
    name: NameRule,
    decorators: DecoratorRule,
}

const PYTHON: LanguageSpec = LanguageSpec {
    definitions: &["function_definition", "class_definition"],
    name: NameRule::Python,
    decorators: DecoratorRule::DecoratedDefinition,
};

const JAVASCRIPT: LanguageSpec = LanguageSpec {
    definitions: &[
        "function_declaration",
        "generator_function_declaration",
        "class_declaration",
        "method_definition",
        "variable_declarator",
    ],
    name: NameRule::Script,
    decorators: DecoratorRule::None,
};

const TYPESCRIPT: LanguageSpec = LanguageSpec {
    definitions: &[
        "function_declaration",
        "generator_function_declaration",
        "class_declaration",
        "method_definition",
        "interface_declaration",
        "type_alias_declaration",
        "variable_declarator",
        "abstract_class_declaration",
    ],
    name: NameRule::Script,
    decorators: DecoratorRule::None,
};

const GO: LanguageSpec = LanguageSpec {
    definitions: &["function_declaration", "method_declaration", "type_spec"],
    name: NameRule::Go,
    decorators: DecoratorRule::None,
};

const RUST: LanguageSpec = LanguageSpec {
    definitions: &["function_item", "struct_item", "enum_item", "type_item", "trait_item"],
    name: NameRule::Rust,
    decorators: DecoratorRule::None,
};

impl AstLanguage {
    /// Resolve a detected language tag to a grammar. `.tsx` files get the
    /// TSX dialect of the TypeScript grammar.
    pub fn for_path(language: &str, path: &str) -> Option<Self> {
        match language {
            "python" => Some(Self::Python),
            "javascript" => Some(Self::JavaScript),
            "typescript" if path.to_ascii_lowercase().ends_with(".tsx") => Some(Self::Tsx),
            "typescript" => Some(Self::TypeScript),
            "go" => Some(Self::Go),
            "rust" => Some(Self::Rust),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript | Self::Tsx => "typescript",
            Self::Go => "go",
            Self::Rust => "rust",
        }
    }

    fn grammar(&self) -> Language {
        match self {
            Self::Python => tree_sitter_python::LANGUAGE.into(),
            Self::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            Self::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Self::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
            Self::Go => tree_sitter_go::LANGUAGE.into(),
            Self::Rust => tree_sitter_rust::LANGUAGE.into(),
        }
    }

    fn spec(&self) -> &'static LanguageSpec {
        match self {
            Self::Python => &PYTHON,
            Self::JavaScript => &JAVASCRIPT,
            Self::TypeScript | Self::Tsx => &TYPESCRIPT,
            Self::Go => &GO,
            Self::Rust => &RUST,
        }
    }
}

thread_local! {
    // Parsers are not Sync; each worker thread initialises one per grammar.
    static PARSERS: RefCell<HashMap<AstLanguage, Parser>> = RefCell::new(HashMap::new());
}

fn parse(language: AstLanguage, content: &str) -> Result<Tree, ChunkerError> {
    PARSERS.with(|cell| {
        let mut parsers = cell.borrow_mut();
        let parser = match parsers.entry(language) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut parser = Parser::new();
                parser
                    .set_language(&language.grammar())
                    .map_err(|e| ChunkerError::ParseError(e.to_string()))?;
                entry.insert(parser)
            }
        };

        parser.parse(content, None).ok_or_else(|| {
            ChunkerError::ParseError(format!("{} parser produced no tree", language.name()))
        })
    })
}

fn children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

fn node_text<'a>(node: Node, content: &'a str) -> Option<&'a str> {
    content.get(node.byte_range())
}

fn child_text(node: Node, kinds: &[&str], content: &str) -> Option<String> {
    children(node)
        .into_iter()
        .find(|child| kinds.contains(&child.kind()))
        .and_then(|child| node_text(child, content))
        .map(String::from)
}

fn first_child_text(node: Node, kind: &str, content: &str) -> Option<String> {
    node.child(0)
        .filter(|child| child.kind() == kind)
        .and_then(|child| node_text(child, content))
        .map(String::from)
}

fn chunk_type_for(kind: &str) -> ChunkType {
    match kind {
        "function_definition"
        | "function_declaration"
        | "generator_function_declaration"
        | "method_definition"
        | "method_declaration"
        | "variable_declarator"
        | "function_item" => ChunkType::Function,
        "class_definition" | "class_declaration" | "abstract_class_declaration" => ChunkType::Class,
        "interface_declaration" | "trait_item" => ChunkType::Interface,
        "type_alias_declaration" | "type_spec" | "struct_item" | "enum_item" | "type_item" => {
            ChunkType::Type
        }
        _ => ChunkType::Block,
    }
}

/// Node kinds of a function value on the right of a declarator.
const FUNCTION_VALUES: &[&str] = &["arrow_function", "function_expression", "function", "generator_function"];

/// A declarator only counts as a definition when it initialises a closure.
fn holds_function_value(node: Node) -> bool {
    children(node).into_iter().any(|child| {
        FUNCTION_VALUES.contains(&child.kind())
            || children(child)
                .into_iter()
                .any(|grandchild| FUNCTION_VALUES.contains(&grandchild.kind()))
    })
}

/// Structural chunker for one language.
pub struct AstChunker {
    language: AstLanguage,
    fallback: ParagraphChunker,
}

impl AstChunker {
    pub fn new(language: AstLanguage, fallback: ParagraphChunker) -> Self {
        Self { language, fallback }
    }

    pub fn language(&self) -> AstLanguage {
        self.language
    }

    fn extract_definitions(&self, root: Node, content: &str) -> Vec<RawChunk> {
        let spec = self.language.spec();
        let mut chunks = Vec::new();

        // Pre-order walk with an explicit stack keeps deep trees off the call stack.
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if spec.definitions.contains(&node.kind()) {
                if let Some(chunk) = self.definition_chunk(node, content) {
                    chunks.push(chunk);
                }
            }
            stack.extend(children(node).into_iter().rev());
        }

        chunks
    }

    fn definition_chunk(&self, node: Node, content: &str) -> Option<RawChunk> {
        if node.kind() == "variable_declarator" && !holds_function_value(node) {
            return None;
        }

        // Text and line range both start at the outermost decorator, if any.
        let span = self.decorated_wrapper(node).unwrap_or(node);
        let text = node_text(span, content)?.to_string();
        let start_line = span.start_position().row + 1;
        let end_line = node.end_position().row + 1;
        let name = self.definition_name(node, content);
        let chunk_type = chunk_type_for(node.kind());

        Some((text, ChunkMetadata::new(start_line, end_line, chunk_type, name)))
    }

    fn definition_name(&self, node: Node, content: &str) -> Option<String> {
        match self.language.spec().name {
            NameRule::Python => child_text(node, &["identifier"], content).or_else(|| {
                children(node)
                    .into_iter()
                    .find_map(|child| child_text(child, &["identifier"], content))
            }),
            NameRule::Script => match node.kind() {
                "function_declaration"
                | "generator_function_declaration"
                | "class_declaration"
                | "abstract_class_declaration"
                | "method_definition" => child_text(
                    node,
                    &["identifier", "property_identifier", "type_identifier"],
                    content,
                ),
                "interface_declaration" | "type_alias_declaration" => {
                    child_text(node, &["type_identifier"], content)
                }
                "variable_declarator" => first_child_text(node, "identifier", content),
                _ => None,
            },
            NameRule::Go => match node.kind() {
                "function_declaration" => child_text(node, &["identifier"], content),
                "method_declaration" => child_text(node, &["field_identifier"], content),
                "type_spec" => first_child_text(node, "type_identifier", content),
                _ => None,
            },
            NameRule::Rust => match node.kind() {
                "function_item" => child_text(node, &["identifier"], content),
                _ => child_text(node, &["type_identifier"], content),
            },
        }
    }

    fn decorated_wrapper<'t>(&self, node: Node<'t>) -> Option<Node<'t>> {
        if self.language.spec().decorators != DecoratorRule::DecoratedDefinition {
            return None;
        }
        node.parent().filter(|p| p.kind() == "decorated_definition")
    }
}

impl Chunker for AstChunker {
    fn chunk(&self, content: &str, path: &str) -> Vec<RawChunk> {
        if content.trim().is_empty() {
            return Vec::new();
        }

        let tree = match parse(self.language, content) {
            Ok(tree) => tree,
            Err(e) => {
                error!(
                    "Tree-sitter parsing failed for {} ({}): {}. Using fallback chunker",
                    path,
                    self.language.name(),
                    e
                );
                return self.fallback.chunk(content, path);
            }
        };

        let root = tree.root_node();
        if root.has_error() {
            debug!(
                "Parse warnings in {} ({}), extracting definitions anyway",
                path,
                self.language.name()
            );
        }

        let chunks = self.extract_definitions(root, content);
        if chunks.is_empty() {
            debug!("No definitions found in {}, using single chunk", path);
            return vec![(content.to_string(), ChunkMetadata::whole_file(line_count(content)))];
        }

        debug!(
            "Extracted {} chunks from {} using tree-sitter ({})",
            chunks.len(),
            path,
            self.language.name()
        );
        chunks
    }
}
