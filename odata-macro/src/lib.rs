//! `lambda!` turns a single-parameter Rust closure into an
//! `odata_core::typed::Lambda`:
//!
//! ```ignore
//! let product_id = 1;
//! let filter = lambda!(|x| x.ProductID == product_id && !x.Discontinued);
//! ```
//!
//! Sub-expressions that do not mention the parameter are evaluated by Rust
//! and captured by value. Values convertible into `odata_core::value::Value`
//! keep their literal type, anything else must implement `serde::Serialize`.
//! Everything else is kept as an expression tree for the query compiler.

use proc_macro::TokenStream;
use proc_macro2::{Ident, TokenStream as TokenStream2, TokenTree};
use quote::{quote, ToTokens};
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, BinOp, Expr, Member, Pat, Stmt, UnOp};

struct LambdaInput {
    parameter: Ident,
    body: TokenStream2,
}

fn parameter_ident(pat: &Pat) -> syn::Result<Ident> {
    match pat {
        Pat::Ident(p) => Ok(p.ident.clone()),
        Pat::Type(p) => parameter_ident(&p.pat),
        other => Err(syn::Error::new_spanned(
            other,
            "lambda parameter must be a plain identifier",
        )),
    }
}

fn mentions(tokens: TokenStream2, parameter: &Ident) -> bool {
    tokens.into_iter().any(|t| match t {
        TokenTree::Ident(ident) => ident == *parameter,
        TokenTree::Group(group) => mentions(group.stream(), parameter),
        _ => false,
    })
}

fn binary_op(op: &BinOp) -> Option<TokenStream2> {
    let name = match op {
        BinOp::Eq(_) => quote!(Eq),
        BinOp::Ne(_) => quote!(Ne),
        BinOp::Lt(_) => quote!(Lt),
        BinOp::Le(_) => quote!(Le),
        BinOp::Gt(_) => quote!(Gt),
        BinOp::Ge(_) => quote!(Ge),
        BinOp::And(_) | BinOp::BitAnd(_) => quote!(And),
        BinOp::Or(_) | BinOp::BitOr(_) => quote!(Or),
        BinOp::Add(_) => quote!(Add),
        BinOp::Sub(_) => quote!(Sub),
        BinOp::Mul(_) => quote!(Mul),
        BinOp::Div(_) => quote!(Div),
        BinOp::Rem(_) => quote!(Mod),
        _ => return None,
    };
    Some(quote!(::odata_core::expression::BinaryOp::#name))
}

/// The expression of a block holding nothing else.
fn block_expr(block: &syn::Block) -> syn::Result<&Expr> {
    match block.stmts.as_slice() {
        [Stmt::Expr(e, None)] => Ok(e),
        _ => Err(syn::Error::new_spanned(
            block,
            "only single-expression blocks are supported in a lambda",
        )),
    }
}

fn capture(expr: &Expr) -> TokenStream2 {
    quote! {
        {
            #[allow(unused_imports)]
            use ::odata_core::typed::{CaptureLiteral as _, CaptureSerialized as _};
            (&::odata_core::typed::Capture(&(#expr))).capture()
        }
    }
}

fn translate(expr: &Expr, parameter: &Ident) -> syn::Result<TokenStream2> {
    let typed = quote!(::odata_core::typed::Expr);
    if let Expr::Lit(lit) = expr {
        return Ok(quote!(#typed::constant(#lit)));
    }
    if !mentions(expr.to_token_stream(), parameter) {
        return Ok(capture(expr));
    }
    match expr {
        Expr::Path(path) if path.path.is_ident(parameter) => {
            let name = parameter.to_string();
            Ok(quote!(#typed::parameter(#name)))
        }
        Expr::Field(field) => {
            let base = translate(&field.base, parameter)?;
            let member = match &field.member {
                Member::Named(ident) => ident.to_string(),
                Member::Unnamed(index) => index.index.to_string(),
            };
            Ok(quote!(#typed::member(#base, #member)))
        }
        Expr::MethodCall(call) => {
            let receiver = translate(&call.receiver, parameter)?;
            let method = call.method.to_string();
            let args = call
                .args
                .iter()
                .map(|a| translate(a, parameter))
                .collect::<syn::Result<Vec<_>>>()?;
            Ok(quote!(#typed::call(Some(#receiver), #method, vec![#(#args),*])))
        }
        Expr::Call(call) => {
            let name = match call.func.as_ref() {
                Expr::Path(path) => path
                    .path
                    .segments
                    .last()
                    .map(|s| s.ident.to_string())
                    .ok_or_else(|| syn::Error::new_spanned(path, "empty function path"))?,
                other => {
                    return Err(syn::Error::new_spanned(
                        other,
                        "only named functions can be called in a lambda",
                    ))
                }
            };
            let args = call
                .args
                .iter()
                .map(|a| translate(a, parameter))
                .collect::<syn::Result<Vec<_>>>()?;
            Ok(quote!(#typed::call(None, #name, vec![#(#args),*])))
        }
        Expr::Unary(unary) => {
            let operand = translate(&unary.expr, parameter)?;
            match unary.op {
                UnOp::Not(_) => Ok(quote!(#typed::not(#operand))),
                UnOp::Neg(_) => Ok(quote!(#typed::negate(#operand))),
                _ => Ok(operand),
            }
        }
        Expr::Binary(binary) => {
            let op = binary_op(&binary.op).ok_or_else(|| {
                syn::Error::new_spanned(&binary.op, "operator is not supported in a lambda")
            })?;
            let left = translate(&binary.left, parameter)?;
            let right = translate(&binary.right, parameter)?;
            Ok(quote!(#typed::binary(#op, #left, #right)))
        }
        Expr::Cast(cast) => {
            let operand = translate(&cast.expr, parameter)?;
            let type_name = cast.ty.to_token_stream().to_string();
            Ok(quote!(#typed::convert(#operand, #type_name)))
        }
        Expr::Struct(object) => {
            let type_name = object
                .path
                .segments
                .last()
                .map(|s| s.ident.to_string())
                .unwrap_or_default();
            let mut fields = Vec::new();
            for field in &object.fields {
                let name = match &field.member {
                    Member::Named(ident) => ident.to_string(),
                    Member::Unnamed(index) => index.index.to_string(),
                };
                let value = translate(&field.expr, parameter)?;
                fields.push(quote!((#name, #value)));
            }
            Ok(quote!(#typed::new_object(#type_name, vec![#(#fields),*])))
        }
        Expr::Index(index) => {
            let target = translate(&index.expr, parameter)?;
            let key = translate(&index.index, parameter)?;
            Ok(quote!(#typed::index(#target, #key)))
        }
        Expr::If(branch) => {
            let condition = translate(&branch.cond, parameter)?;
            let then = translate(block_expr(&branch.then_branch)?, parameter)?;
            let otherwise = match &branch.else_branch {
                Some((_, e)) => match e.as_ref() {
                    Expr::Block(block) => translate(block_expr(&block.block)?, parameter)?,
                    other => translate(other, parameter)?,
                },
                None => {
                    return Err(syn::Error::new_spanned(
                        branch,
                        "an `if` in a lambda needs an `else` branch",
                    ))
                }
            };
            Ok(quote!(#typed::conditional(#condition, #then, #otherwise)))
        }
        Expr::Paren(inner) => translate(&inner.expr, parameter),
        Expr::Group(inner) => translate(&inner.expr, parameter),
        Expr::Reference(inner) => translate(&inner.expr, parameter),
        other => Err(syn::Error::new_spanned(
            other,
            "expression is not supported in a lambda",
        )),
    }
}

impl Parse for LambdaInput {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let closure: syn::ExprClosure = input.parse()?;
        if closure.inputs.len() != 1 {
            return Err(syn::Error::new_spanned(
                &closure.inputs,
                "lambda takes exactly one parameter",
            ));
        }
        let parameter = parameter_ident(&closure.inputs[0])?;
        let body = translate(&closure.body, &parameter)?;
        Ok(LambdaInput { parameter, body })
    }
}

impl ToTokens for LambdaInput {
    fn to_tokens(&self, tokens: &mut TokenStream2) {
        let parameter = self.parameter.to_string();
        let body = &self.body;
        tokens.extend(quote! {
            ::odata_core::typed::Lambda::new(#parameter, #body)
        });
    }
}

#[proc_macro]
pub fn lambda(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as LambdaInput);
    input.to_token_stream().into()
}
