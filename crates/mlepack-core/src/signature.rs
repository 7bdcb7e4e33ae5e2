//! # Signature Extraction
//!
//! Walks a module's syntax tree and emits one [`FunctionDescriptor`] per
//! exported function, in source order.
//!
//! ## What counts as exported
//!
//! - `export function f(...)` declarations
//! - `export const f = <function expression>` bindings (named after the binding)
//! - the same shapes nested inside an exported block (namespace), provided the
//!   nested item is itself exported
//!
//! Non-exported items are ignored entirely, including whatever they contain.
//!
//! ## Type classification
//!
//! Static types are produced by a [`TypeResolver`] and classified three ways:
//! `string -> String`, `number -> Number`, `void -> None`. Any other return type
//! becomes `None` with a [`Warning`]. A parameter that does not classify as
//! `String` or `Number` is fatal.

use crate::{FunctionDescriptor, MleError, Parameter, Type, Warning};

// =============================================================================
// SYNTAX TREE
// =============================================================================

/// A parsed module: its top-level items in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Module {
    pub items: Vec<Item>,
}

/// A top-level (or block-level) item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// `function name(...)`.
    Function { exported: bool, function: FunctionNode },
    /// `const name = <init>`.
    Binding {
        exported: bool,
        name: String,
        init: Expr,
    },
    /// A construct that may contain further items (namespace, module block).
    Block {
        exported: bool,
        name: String,
        items: Vec<Item>,
    },
}

impl Item {
    #[must_use]
    pub fn is_exported(&self) -> bool {
        match self {
            Item::Function { exported, .. }
            | Item::Binding { exported, .. }
            | Item::Block { exported, .. } => *exported,
        }
    }
}

/// The initializer of a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Function(FunctionNode),
    Other,
}

/// A function declaration or expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionNode {
    /// Declared name; `None` for anonymous expressions.
    pub name: Option<String>,
    pub params: Vec<ParamNode>,
    pub return_annotation: Option<String>,
}

/// A declared parameter with its optional annotation text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamNode {
    pub name: String,
    pub annotation: Option<String>,
}

// =============================================================================
// TYPE RESOLUTION SEAM
// =============================================================================

/// The static signature of a function as a type checker sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticSignature {
    /// `(name, static type)` per parameter.
    pub parameters: Vec<(String, String)>,
    pub return_type: String,
}

/// Resolves the static types of a function.
///
/// The full type checker is an external collaborator; implementors adapt it to
/// this trait.
pub trait TypeResolver {
    fn resolve(&self, function: &FunctionNode) -> Result<StaticSignature, MleError>;
}

/// Resolves types from declared annotations only.
///
/// Missing parameter annotations resolve to `any` (and therefore fail
/// classification); a missing return annotation resolves to `void`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnotationResolver;

impl TypeResolver for AnnotationResolver {
    fn resolve(&self, function: &FunctionNode) -> Result<StaticSignature, MleError> {
        let parameters = function
            .params
            .iter()
            .map(|p| {
                let ty = p.annotation.as_deref().unwrap_or("any");
                (p.name.clone(), ty.trim().to_string())
            })
            .collect();
        let return_type = function
            .return_annotation
            .as_deref()
            .map(str::trim)
            .unwrap_or("void")
            .to_string();
        Ok(StaticSignature {
            parameters,
            return_type,
        })
    }
}

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// Map a static type onto a wire type. `None` means unrecognised.
#[must_use]
pub fn wire_type(static_type: &str) -> Option<Type> {
    match static_type.trim() {
        "string" => Some(Type::String),
        "number" => Some(Type::Number),
        "void" => Some(Type::None),
        _ => None,
    }
}

fn classify_parameter(function: &str, name: &str, static_type: &str) -> Result<Type, MleError> {
    match wire_type(static_type) {
        Some(ty) if ty.is_concrete() => Ok(ty),
        _ => Err(MleError::UntypeableParameter {
            function: function.to_string(),
            parameter: name.to_string(),
        }),
    }
}

fn classify_return(function: &str, static_type: &str, warnings: &mut Vec<Warning>) -> Type {
    wire_type(static_type).unwrap_or_else(|| {
        warnings.push(Warning::UnclassifiedReturn {
            function: function.to_string(),
            static_type: static_type.to_string(),
        });
        Type::None
    })
}

// =============================================================================
// EXTRACTOR
// =============================================================================

/// Result of one extraction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub descriptors: Vec<FunctionDescriptor>,
    pub warnings: Vec<Warning>,
}

/// Extracts descriptors for every exported function of a module.
pub struct SignatureExtractor<R> {
    resolver: R,
}

impl<R: TypeResolver> SignatureExtractor<R> {
    #[must_use]
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    /// Walk the module and collect descriptors in source order.
    pub fn extract(&self, module: &Module) -> Result<Extraction, MleError> {
        let mut extraction = Extraction::default();
        self.visit_items(&module.items, &mut extraction)?;
        Ok(extraction)
    }

    fn visit_items(&self, items: &[Item], out: &mut Extraction) -> Result<(), MleError> {
        for item in items.iter().filter(|i| i.is_exported()) {
            match item {
                Item::Function { function, .. } => {
                    let name = function.name.as_deref().ok_or_else(|| {
                        MleError::Resolve("exported function declaration without a name".into())
                    })?;
                    self.describe(name, function, out)?;
                }
                Item::Binding {
                    name,
                    init: Expr::Function(function),
                    ..
                } => self.describe(name, function, out)?,
                Item::Binding { .. } => {}
                Item::Block { items, .. } => self.visit_items(items, out)?,
            }
        }
        Ok(())
    }

    fn describe(
        &self,
        name: &str,
        function: &FunctionNode,
        out: &mut Extraction,
    ) -> Result<(), MleError> {
        let signature = self.resolver.resolve(function)?;
        let parameters = signature
            .parameters
            .iter()
            .map(|(param, ty)| classify_parameter(name, param, ty).map(|t| Parameter::new(param, t)))
            .collect::<Result<Vec<_>, _>>()?;
        let return_type = classify_return(name, &signature.return_type, &mut out.warnings);

        out.descriptors
            .push(FunctionDescriptor::new(name, parameters, return_type));
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn func(name: Option<&str>, params: &[(&str, Option<&str>)], ret: Option<&str>) -> FunctionNode {
        FunctionNode {
            name: name.map(str::to_string),
            params: params
                .iter()
                .map(|(n, a)| ParamNode {
                    name: (*n).to_string(),
                    annotation: a.map(str::to_string),
                })
                .collect(),
            return_annotation: ret.map(str::to_string),
        }
    }

    fn extract(items: Vec<Item>) -> Result<Extraction, MleError> {
        SignatureExtractor::new(AnnotationResolver).extract(&Module { items })
    }

    #[test]
    fn exported_declaration_is_described() {
        let out = extract(vec![Item::Function {
            exported: true,
            function: func(Some("add"), &[("a", Some("number")), ("b", Some("number"))], Some("number")),
        }])
        .expect("extract");

        assert_eq!(out.descriptors.len(), 1);
        let d = &out.descriptors[0];
        assert_eq!(d.name, "add");
        assert_eq!(d.return_type, Type::Number);
        assert_eq!(d.parameters[1], Parameter::new("b", Type::Number));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn binding_takes_name_from_identifier() {
        let out = extract(vec![Item::Binding {
            exported: true,
            name: "greet".into(),
            init: Expr::Function(func(None, &[("who", Some("string"))], Some("string"))),
        }])
        .expect("extract");

        assert_eq!(out.descriptors[0].name, "greet");
    }

    #[test]
    fn non_exported_items_are_ignored_with_their_contents() {
        let out = extract(vec![
            Item::Function {
                exported: false,
                function: func(Some("hidden"), &[], Some("string")),
            },
            Item::Block {
                exported: false,
                name: "Inner".into(),
                items: vec![Item::Function {
                    exported: true,
                    function: func(Some("nested"), &[], Some("string")),
                }],
            },
        ])
        .expect("extract");

        assert!(out.descriptors.is_empty());
    }

    #[test]
    fn exported_blocks_are_recursed() {
        let out = extract(vec![Item::Block {
            exported: true,
            name: "Utils".into(),
            items: vec![
                Item::Function {
                    exported: true,
                    function: func(Some("one"), &[], Some("number")),
                },
                Item::Function {
                    exported: false,
                    function: func(Some("two"), &[], Some("number")),
                },
            ],
        }])
        .expect("extract");

        let names: Vec<_> = out.descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["one"]);
    }

    #[test]
    fn unknown_return_type_warns_and_becomes_none() {
        let out = extract(vec![Item::Function {
            exported: true,
            function: func(Some("rows"), &[], Some("string[]")),
        }])
        .expect("extract");

        assert_eq!(out.descriptors[0].return_type, Type::None);
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn untyped_parameter_is_fatal() {
        let err = extract(vec![Item::Function {
            exported: true,
            function: func(Some("bad"), &[("x", None)], Some("number")),
        }])
        .expect_err("must fail");

        assert!(matches!(err, MleError::UntypeableParameter { ref parameter, .. } if parameter == "x"));
    }

    #[test]
    fn void_parameter_is_fatal() {
        let err = extract(vec![Item::Function {
            exported: true,
            function: func(Some("bad"), &[("x", Some("void"))], None),
        }]);
        assert!(err.is_err());
    }

    #[test]
    fn non_function_binding_is_skipped() {
        let out = extract(vec![Item::Binding {
            exported: true,
            name: "VERSION".into(),
            init: Expr::Other,
        }])
        .expect("extract");
        assert!(out.descriptors.is_empty());
    }
}
