//! `#[derive(BinaryCodec)]`.
//!
//! Fields are written in declaration order using their own `Encode` impls,
//! so the output is deterministic and safe to hash. Enums are prefixed with a
//! one-byte tag: the explicit discriminant when given, otherwise the previous
//! tag plus one. Unions are rejected.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DataEnum, DeriveInput, Fields, parse_macro_input};

pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let (encode_body, decode_body) = match &input.data {
        Data::Struct(data) => (
            encode_struct(&data.fields),
            {
                let ctor = construct(quote!(Self), &data.fields);
                quote! { Ok(#ctor) }
            },
        ),
        Data::Enum(data) => encode_decode_enum(data)?,
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "BinaryCodec cannot be derived for unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics crate::types::encoding::Encode for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                #encode_body
            }
        }

        impl #impl_generics crate::types::encoding::Decode for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn decode(
                input: &mut &[u8],
            ) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                #decode_body
            }
        }
    })
}

fn encode_struct(fields: &Fields) -> TokenStream2 {
    let writes: Vec<TokenStream2> = match fields {
        Fields::Named(named) => named
            .named
            .iter()
            .map(|f| {
                let ident = &f.ident;
                quote! { crate::types::encoding::Encode::encode(&self.#ident, out); }
            })
            .collect(),
        Fields::Unnamed(unnamed) => (0..unnamed.unnamed.len())
            .map(|i| {
                let index = syn::Index::from(i);
                quote! { crate::types::encoding::Encode::encode(&self.#index, out); }
            })
            .collect(),
        Fields::Unit => Vec::new(),
    };
    quote! { #(#writes)* }
}

/// Builds `path { a: decode?, .. }`, `path(decode?, ..)` or `path`.
fn construct(path: TokenStream2, fields: &Fields) -> TokenStream2 {
    let read = quote! { crate::types::encoding::Decode::decode(input)? };
    match fields {
        Fields::Named(named) => {
            let idents = named.named.iter().map(|f| &f.ident);
            quote! { #path { #(#idents: #read,)* } }
        }
        Fields::Unnamed(unnamed) => {
            let reads = (0..unnamed.unnamed.len()).map(|_| read.clone());
            quote! { #path(#(#reads),*) }
        }
        Fields::Unit => path,
    }
}

/// Pattern binding every field of a variant, plus the bound names in order.
fn bind(variant: &syn::Ident, fields: &Fields) -> (TokenStream2, Vec<syn::Ident>) {
    match fields {
        Fields::Named(named) => {
            let idents: Vec<syn::Ident> =
                named.named.iter().filter_map(|f| f.ident.clone()).collect();
            (quote! { Self::#variant { #(#idents),* } }, idents)
        }
        Fields::Unnamed(unnamed) => {
            let idents: Vec<syn::Ident> = (0..unnamed.unnamed.len())
                .map(|i| format_ident!("field{}", i))
                .collect();
            (quote! { Self::#variant(#(#idents),*) }, idents)
        }
        Fields::Unit => (quote! { Self::#variant }, Vec::new()),
    }
}

fn encode_decode_enum(data: &DataEnum) -> syn::Result<(TokenStream2, TokenStream2)> {
    let tags = variant_tags(data)?;
    let mut encode_arms = Vec::with_capacity(tags.len());
    let mut decode_arms = Vec::with_capacity(tags.len());

    for (variant, tag) in data.variants.iter().zip(tags) {
        let ident = &variant.ident;
        let (pattern, bound) = bind(ident, &variant.fields);
        encode_arms.push(quote! {
            #pattern => {
                crate::types::encoding::Encode::encode(&#tag, out);
                #(crate::types::encoding::Encode::encode(#bound, out);)*
            }
        });
        let ctor = construct(quote!(Self::#ident), &variant.fields);
        decode_arms.push(quote! { #tag => Ok(#ctor), });
    }

    let encode = quote! {
        match self {
            #(#encode_arms)*
        }
    };
    let decode = quote! {
        let tag: u8 = crate::types::encoding::Decode::decode(input)?;
        match tag {
            #(#decode_arms)*
            _ => Err(crate::types::encoding::DecodeError::InvalidValue),
        }
    };
    Ok((encode, decode))
}

fn variant_tags(data: &DataEnum) -> syn::Result<Vec<u8>> {
    let mut tags = Vec::with_capacity(data.variants.len());
    let mut next: u16 = 0;

    for variant in &data.variants {
        let tag = match &variant.discriminant {
            Some((_, expr)) => literal_tag(expr)?,
            None => u8::try_from(next).map_err(|_| {
                syn::Error::new_spanned(variant, "BinaryCodec enums are limited to 256 tags")
            })?,
        };
        if tags.contains(&tag) {
            return Err(syn::Error::new_spanned(variant, "duplicate BinaryCodec tag"));
        }
        tags.push(tag);
        next = u16::from(tag) + 1;
    }

    Ok(tags)
}

fn literal_tag(expr: &syn::Expr) -> syn::Result<u8> {
    if let syn::Expr::Lit(syn::ExprLit {
        lit: syn::Lit::Int(int),
        ..
    }) = expr
    {
        return int.base10_parse::<u8>();
    }
    Err(syn::Error::new_spanned(
        expr,
        "BinaryCodec discriminants must be u8 integer literals",
    ))
}
