// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! Accessor derive for the harness's configuration and context structures
//!
//! Most harness structures hold small `Copy` values (magic numbers, sizes, flags) that
//! are more pleasant to read by value, next to borrowed components (page tables, the
//! allocation table) that must be handed out by reference. The derive supports both:
//!
//! - `#[getters(deref)]` on the struct or a field returns the field by value
//! - `#[getters(skip_deref)]` on a field opts a non-`Copy` field back out of a struct-level
//!   `deref`
//! - `#[getters(mutable)]` on the struct or a field adds a `<field>_mut` accessor
//! - `#[getters(skip)]` on a field generates nothing for it

use darling::{ast::Data, util::Flag, FromDeriveInput, FromField};
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote, ToTokens};
use syn::{parse_macro_input, DeriveInput, Generics, Ident, Type};

#[derive(Debug, FromField)]
#[darling(attributes(getters))]
struct GettersField {
    ident: Option<Ident>,
    ty: Type,
    mutable: Flag,
    deref: Flag,
    skip_deref: Flag,
    skip: Flag,
}

#[derive(Debug, FromDeriveInput)]
#[darling(
    attributes(getters),
    supports(struct_named),
    forward_attrs(allow, doc, cfg)
)]
struct Getters {
    ident: Ident,
    generics: Generics,
    data: Data<(), GettersField>,
    mutable: Flag,
    deref: Flag,
}

impl Getters {
    fn field_tokens(&self, field: &GettersField) -> Option<TokenStream2> {
        let ident = field.ident.as_ref()?;
        let ty = &field.ty;
        let by_value = !field.skip_deref.is_present()
            && (field.deref.is_present() || self.deref.is_present());
        let mutable = field.mutable.is_present() || self.mutable.is_present();

        let doc = format!("Return the `{ident}` field");
        let doc_mut = format!("Return a mutable reference to the `{ident}` field");

        let getter = if by_value {
            quote! {
                #[inline(always)]
                #[doc = #doc]
                pub fn #ident(&self) -> #ty {
                    self.#ident
                }
            }
        } else {
            quote! {
                #[inline(always)]
                #[doc = #doc]
                pub fn #ident(&self) -> &#ty {
                    &self.#ident
                }
            }
        };

        if !mutable {
            return Some(getter);
        }

        let ident_mut = format_ident!("{}_mut", ident);

        Some(quote! {
            #getter

            #[inline(always)]
            #[doc = #doc_mut]
            pub fn #ident_mut(&mut self) -> &mut #ty {
                &mut self.#ident
            }
        })
    }
}

impl ToTokens for Getters {
    fn to_tokens(&self, tokens: &mut TokenStream2) {
        let ident = &self.ident;
        let (impl_generics, ty_generics, where_clause) = self.generics.split_for_impl();

        let fields = match self.data.as_ref().take_struct() {
            Some(fields) => fields.fields,
            None => {
                tokens.extend(quote! {
                    compile_error!("Getters can only be derived for structs with named fields");
                });
                return;
            }
        };

        let accessors = fields
            .iter()
            .filter(|f| !f.skip.is_present())
            .filter_map(|f| self.field_tokens(f))
            .collect::<TokenStream2>();

        tokens.extend(quote! {
            impl #impl_generics #ident #ty_generics #where_clause {
                #accessors
            }
        });
    }
}

#[proc_macro_derive(Getters, attributes(getters))]
#[allow(non_snake_case)]
/// Add accessors (by reference, by value or mutable) for the fields of a struct
///
/// ```rust,ignore
/// use getters::Getters;
///
/// #[derive(Getters)]
/// #[getters(deref, mutable)]
/// pub struct DiskGeometry {
///     heads: u32,
/// }
///
/// let mut g = DiskGeometry { heads: 16 };
/// assert_eq!(g.heads(), 16);
/// *g.heads_mut() = 255;
/// assert_eq!(g.heads(), 255);
/// ```
pub fn Getters(input: TokenStream) -> TokenStream {
    let getters = match Getters::from_derive_input(&parse_macro_input!(input as DeriveInput)) {
        Ok(g) => g,
        Err(e) => {
            return TokenStream::from(e.write_errors());
        }
    };

    let mut tokens = TokenStream2::new();

    getters.to_tokens(&mut tokens);

    tokens.into()
}
