//! `#[derive(Xdr)]`: emits the static type description (`Shape`) that the
//! `xdr-wire` codec engine compiles against.
//!
//! The macro does not generate encode/decode code. It records, per field,
//! the name, the raw `#[xdr("...")]` tag text, a lazy edge to the field
//! type's shape, and a pair of type-erased accessors. Tag parsing and
//! codec construction happen at runtime on first use, so schema errors
//! are reported uniformly through the engine's error codecs.

extern crate proc_macro;

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{parse_macro_input, Data, DeriveInput, Field, Fields, LitStr};

#[proc_macro_derive(Xdr, attributes(xdr))]
pub fn derive_xdr(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Extracts the tag text of a field's `#[xdr("...")]` attribute, if any.
fn field_tag(field: &Field) -> syn::Result<String> {
    let mut tag = None;
    for attr in &field.attrs {
        if !attr.path().is_ident("xdr") {
            continue;
        }
        if tag.is_some() {
            return Err(syn::Error::new_spanned(attr, "duplicate #[xdr] attribute"));
        }
        tag = Some(attr.parse_args::<LitStr>()?.value());
    }
    Ok(tag.unwrap_or_default())
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let name_str = name.to_string();

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.generics,
            "generic types cannot derive Xdr",
        ));
    }

    let fields: Vec<&Field> = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => named.named.iter().collect(),
            Fields::Unit => Vec::new(),
            Fields::Unnamed(_) => {
                return Err(syn::Error::new_spanned(
                    &data.fields,
                    "tuple structs cannot derive Xdr; use named fields",
                ));
            }
        },
        Data::Enum(_) => {
            return Err(syn::Error::new_spanned(
                name,
                "enums cannot derive Xdr; declare XDR unions as structs with `union:` tags",
            ));
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                name,
                "untagged unions cannot derive Xdr",
            ));
        }
    };

    let mut accessors = Vec::with_capacity(fields.len() * 2);
    let mut defs = Vec::with_capacity(fields.len());

    for (index, field) in fields.iter().enumerate() {
        let ident = field
            .ident
            .as_ref()
            .ok_or_else(|| syn::Error::new_spanned(field, "expected a named field"))?;
        let ty = &field.ty;
        let field_name = ident.to_string();
        let tag = field_tag(field)?;

        let get = format_ident!("__xdr_get_{}", index);
        let get_mut = format_ident!("__xdr_get_mut_{}", index);

        accessors.push(quote! {
            fn #get(value: &dyn ::core::any::Any) -> &dyn ::core::any::Any {
                &::xdr_wire::shape::expect_ref::<#name>(value).#ident
            }
            fn #get_mut(value: &mut dyn ::core::any::Any) -> &mut dyn ::core::any::Any {
                &mut ::xdr_wire::shape::expect_mut::<#name>(value).#ident
            }
        });

        defs.push(quote! {
            ::xdr_wire::shape::FieldDef {
                name: #field_name,
                tag: #tag,
                shape: <#ty as ::xdr_wire::XdrType>::shape,
                get: #get,
                get_mut: #get_mut,
            }
        });
    }

    let field_count = defs.len();

    Ok(quote! {
        const _: () = {
            #(#accessors)*

            fn __xdr_type_id() -> ::core::any::TypeId {
                ::core::any::TypeId::of::<#name>()
            }

            static __XDR_FIELDS: [::xdr_wire::shape::FieldDef; #field_count] = [#(#defs),*];

            static __XDR_SHAPE: ::xdr_wire::shape::Shape = ::xdr_wire::shape::Shape {
                name: #name_str,
                type_id: __xdr_type_id,
                kind: ::xdr_wire::shape::Kind::Struct {
                    fields: &__XDR_FIELDS,
                },
            };

            impl ::xdr_wire::XdrType for #name {
                fn shape() -> &'static ::xdr_wire::shape::Shape {
                    &__XDR_SHAPE
                }
            }
        };
    })
}
