//! `#[derive(Error)]`, a small in-house replacement for `thiserror`.
//!
//! ```ignore
//! use powchain_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum MempoolError {
//!     #[error("invalid transaction: {0}")]
//!     InvalidTransaction(#[source] TxError),
//!
//!     #[error("mempool is full ({capacity} entries)")]
//!     PoolFull { capacity: usize },
//! }
//! ```
//!
//! Every variant (or the struct itself) needs an `#[error("...")]` message.
//! Messages may reference tuple fields as `{0}` and named fields by name,
//! with any format spec. Fields the message does not mention are ignored.
//! A field marked `#[source]` is returned from `Error::source`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{ToTokens, format_ident, quote};
use syn::{Attribute, Data, DeriveInput, Fields, Lit, Meta, parse_macro_input};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

/// One displayable shape: a struct body or a single enum variant.
struct Shape {
    pattern: TokenStream2,
    format: String,
    args: Vec<syn::Ident>,
    source: Option<syn::Ident>,
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let shapes = match &input.data {
        Data::Enum(data) => data
            .variants
            .iter()
            .map(|variant| {
                let message = message(&variant.attrs, variant)?;
                let ident = &variant.ident;
                shape(quote!(Self::#ident), &variant.fields, message)
            })
            .collect::<syn::Result<Vec<_>>>()?,
        Data::Struct(data) => {
            let message = message(&input.attrs, &input.ident)?;
            vec![shape(quote!(Self), &data.fields, message)?]
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "Error cannot be derived for unions",
            ));
        }
    };

    let display_arms = shapes.iter().map(|s| {
        let pattern = &s.pattern;
        let format = &s.format;
        let args = &s.args;
        quote! { #pattern => write!(f, #format, #(#args = #args),*), }
    });

    let source_arms = shapes.iter().filter_map(|s| {
        let pattern = &s.pattern;
        s.source.as_ref().map(|field| {
            quote! {
                #pattern => ::std::option::Option::Some(
                    #field as &(dyn ::std::error::Error + 'static)
                ),
            }
        })
    });

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                match self {
                    #(#display_arms)*
                }
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {
            #[allow(unused_variables, unreachable_patterns)]
            fn source(&self) -> ::std::option::Option<&(dyn ::std::error::Error + 'static)> {
                match self {
                    #(#source_arms)*
                    _ => ::std::option::Option::None,
                }
            }
        }
    })
}

fn shape(path: TokenStream2, fields: &Fields, message: String) -> syn::Result<Shape> {
    let mut format = message;
    let mut bound = Vec::new();
    let mut source = None;

    let pattern = match fields {
        Fields::Named(named) => {
            for field in &named.named {
                let ident = field.ident.clone().ok_or_else(|| {
                    syn::Error::new_spanned(field, "named field without identifier")
                })?;
                if has_source_attr(&field.attrs) {
                    source = Some(ident.clone());
                }
                bound.push(ident);
            }
            quote! { #path { #(#bound),* } }
        }
        Fields::Unnamed(unnamed) => {
            for (i, field) in unnamed.unnamed.iter().enumerate() {
                let ident = format_ident!("field{}", i);
                format = rename_positional(&format, i, &ident);
                if has_source_attr(&field.attrs) {
                    source = Some(ident.clone());
                }
                bound.push(ident);
            }
            quote! { #path(#(#bound),*) }
        }
        Fields::Unit => path,
    };

    let args = bound
        .into_iter()
        .filter(|ident| mentions(&format, &ident.to_string()))
        .collect();

    Ok(Shape {
        pattern,
        format,
        args,
        source,
    })
}

fn has_source_attr(attrs: &[Attribute]) -> bool {
    attrs.iter().any(|attr| attr.path().is_ident("source"))
}

/// Rewrites `{i}` and `{i:spec}` to use the bound identifier.
fn rename_positional(format: &str, index: usize, ident: &syn::Ident) -> String {
    format
        .replace(&format!("{{{}}}", index), &format!("{{{}}}", ident))
        .replace(&format!("{{{}:", index), &format!("{{{}:", ident))
}

fn mentions(format: &str, name: &str) -> bool {
    format.contains(&format!("{{{}}}", name)) || format.contains(&format!("{{{}:", name))
}

fn message<T: ToTokens>(attrs: &[Attribute], target: &T) -> syn::Result<String> {
    let attr = attrs
        .iter()
        .find(|attr| attr.path().is_ident("error"))
        .ok_or_else(|| {
            syn::Error::new_spanned(target, "missing #[error(\"...\")] display message")
        })?;

    let Meta::List(list) = &attr.meta else {
        return Err(syn::Error::new_spanned(
            &attr.meta,
            "expected #[error(\"message\")]",
        ));
    };

    match syn::parse2::<Lit>(list.tokens.clone()) {
        Ok(Lit::Str(text)) => Ok(text.value()),
        _ => Err(syn::Error::new_spanned(
            &attr.meta,
            "#[error] takes a single string literal",
        )),
    }
}
