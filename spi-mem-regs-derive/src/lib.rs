use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{
    Data, DataStruct, DeriveInput, Expr, Fields, Ident, Path, Result, Type, TypeArray, Visibility,
};

macro_rules! bail {
    ($msg:expr) => {
        return ::core::result::Result::Err(::syn::Error::new(
            ::proc_macro2::Span::call_site(),
            $msg,
        ))
    };
    ($span:expr, $msg:expr) => {
        return ::core::result::Result::Err(::syn::Error::new_spanned($span, $msg))
    };
}

/// Derives a volatile pointer type `<Name>Ptr<'a>` for a `#[repr(C)]` register block.
///
/// Every field carries a `#[reg(...)]` attribute:
/// - `#[reg(path::to::Register)]` on a `u32` field yields an accessor returning
///   `Reg<'a, Register>`, on a `[u32; N]` field one returning `RegArray<'a, Register, N>`;
/// - `#[reg(reserved)]` marks padding, which gets no accessor.
///
/// The field offset is checked at compile time against `RegisterSpec::OFFSET`.
#[proc_macro_derive(RegMap, attributes(reg))]
pub fn derive_reg_map(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input);

    impl_reg(&input).unwrap_or_else(|err| err.into_compile_error().into())
}

fn impl_reg(ast: &DeriveInput) -> Result<TokenStream> {
    let name = &ast.ident;
    let vis = &ast.vis;
    let ptr_vis = parse_visibility(vis)?;

    check_repr(ast)?;

    let Data::Struct(DataStruct { ref fields, .. }) = ast.data else {
        bail!(ast, "RegMap derive supports only structs");
    };
    let Fields::Named(named) = fields else {
        bail!(ast, "RegMap derive supports only structs with named fields");
    };

    let ptr_name = Ident::new(&format!("{}Ptr", name), Span::call_site());
    let mod_name = Ident::new(&format!("_mod_{}", name), Span::call_site());
    let mut all_methods = quote!();
    let mut all_checks = quote!();
    for field in named.named.iter() {
        if let Some(reg) = parse_field(name, field)? {
            all_methods.extend(reg.method);
            all_checks.extend(reg.check);
        }
    }

    let doc_msg_top = format!(
        "A pointer to the register block `{name}`.\n\
        \n\
        Every access through it is volatile and no reference to `{name}` is ever created."
    );
    let doc_msg_from_ptr = format!(
        "\
        Creates a new `{ptr_name}`, a pointer to `{name}`.\n\
        \n\
        # Safety\n\
        - `ptr` must not be null;\n\
        - `ptr` must point to a valid instance of `{name}`;\n\
        - `ptr` must be valid for the whole lifetime `'a`;\n\
        - all fields of `{name}` must allow volatile reads/writes."
    );
    let doc_msg_from_mut =
        format!("Return a pointer to `{name}` from a mutable (exclusive) reference.");
    let all = quote!(
        #[allow(non_snake_case)]
        mod #mod_name {
            use super::*;
            #[doc = #doc_msg_top]
            #ptr_vis struct #ptr_name<'a> {
                ptr: ::core::ptr::NonNull<#name>,
                _ref: ::core::marker::PhantomData<&'a #name>,
            }
            impl<'a> #ptr_name<'a> {
                #[doc = #doc_msg_from_ptr]
                #[inline]
                pub const unsafe fn from_ptr(ptr: *mut #name) -> Self {
                    Self {
                        ptr: unsafe { ::core::ptr::NonNull::new_unchecked(ptr) },
                        _ref: ::core::marker::PhantomData,
                    }
                }

                #[doc = #doc_msg_from_mut]
                #[inline]
                pub fn from_mut(reg: &'a mut #name) -> Self {
                    // safe because we are the only borrowers (&mut)
                    // and the borrow is valid for 'a
                    unsafe { Self::from_ptr(reg) }
                }

                /// Returns a raw pointer to the underlying register block.
                #[inline]
                pub const fn as_ptr(&self) -> *mut #name {
                    self.ptr.as_ptr()
                }
                #all_methods
            }
            #all_checks
        }
        #vis use #mod_name::#ptr_name;
    );
    Ok(all.into())
}

fn parse_visibility(vis: &Visibility) -> Result<proc_macro2::TokenStream> {
    Ok(match vis {
        Visibility::Inherited => quote!(pub(super)),
        Visibility::Public(_) => quote!(pub),
        Visibility::Restricted(vis_restricted) => {
            if vis_restricted.in_token.is_some() {
                bail!(
                    vis,
                    "RegMap derive does not support `pub(in ...)` visibilities"
                );
            } else {
                let path = &vis_restricted.path;
                if path.is_ident("crate") {
                    quote!(pub(crate))
                } else if path.is_ident("super") {
                    quote!(pub(in super::super))
                } else if path.is_ident("self") {
                    quote!(pub(super))
                } else {
                    bail!(vis, "RegMap derive found an unexpected visibility");
                }
            }
        }
    })
}

mod kw {
    syn::custom_keyword!(reserved);
}

/// Contents of a `#[reg(...)]` attribute.
enum RegAttr {
    Reserved,
    Spec(Path),
}
impl syn::parse::Parse for RegAttr {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let fork = input.fork();
        if fork.parse::<kw::reserved>().is_ok() && fork.is_empty() {
            input.parse::<kw::reserved>()?;
            Ok(RegAttr::Reserved)
        } else {
            input.parse().map(RegAttr::Spec)
        }
    }
}

fn check_repr(input: &DeriveInput) -> Result<()> {
    let mut repr_c = false;

    for attr in &input.attrs {
        if attr.path().is_ident("repr") {
            attr.parse_nested_meta(|meta| {
                // #[repr(C)]
                if meta.path.is_ident("C") {
                    repr_c = true;
                    return Ok(());
                }

                // #[repr(align(N))] keeps field offsets, only the block alignment grows
                if meta.path.is_ident("align") {
                    let content;
                    syn::parenthesized!(content in meta.input);
                    let lit: syn::LitInt = content.parse()?;
                    lit.base10_parse::<usize>()?;
                    return Ok(());
                }

                if meta.path.is_ident("transparent") {
                    return Err(meta.error("RegMap derive does not support #[repr(transparent)]"));
                }

                // #[repr(packed)] or #[repr(packed(N))], omitted N means 1
                if meta.path.is_ident("packed") {
                    return Err(meta.error("RegMap derive does not support #[repr(packed)]"));
                }

                Err(meta.error("RegMap derive found an unrecognized #[repr(...)] attribute"))
            })?;
        }
    }

    if repr_c {
        Ok(())
    } else {
        bail!("RegMap derive requires #[repr(C)]")
    }
}

fn parse_reg_attr(field: &syn::Field) -> Result<RegAttr> {
    let mut found = None;
    for attr in &field.attrs {
        if attr.path().is_ident("reg") {
            if found.is_some() {
                bail!(attr, "duplicate #[reg(...)] attribute");
            }
            found = Some(attr.parse_args::<RegAttr>()?);
        }
    }
    match found {
        Some(reg) => Ok(reg),
        None => bail!(
            field,
            "RegMap derive requires #[reg(<register spec>)] or #[reg(reserved)] on every field"
        ),
    }
}

fn is_u32(ty: &Type) -> bool {
    match ty {
        Type::Path(type_path) => type_path.qself.is_none() && type_path.path.is_ident("u32"),
        _ => false,
    }
}

/// Accessor method and offset check generated for one register field.
struct RegField {
    method: proc_macro2::TokenStream,
    check: proc_macro2::TokenStream,
}

fn parse_field(block: &Ident, field: &syn::Field) -> Result<Option<RegField>> {
    let Some(name) = field.ident.as_ref() else {
        bail!(field, "RegMap derive supports only named fields");
    };
    let spec = match parse_reg_attr(field)? {
        RegAttr::Reserved => return Ok(None),
        RegAttr::Spec(spec) => spec,
    };
    let doc = parse_docs(field)?;
    let offset_msg = format!("`{block}::{name}` is not at the offset of its register");
    let check = quote!(
        const _: () = ::core::assert!(
            ::core::mem::offset_of!(#block, #name)
                == <#spec as ::spi_mem_regs::RegisterSpec>::OFFSET,
            #offset_msg
        );
    );
    let method = match &field.ty {
        ty if is_u32(ty) => quote!(
            #doc
            #[inline]
            pub fn #name (&self) -> ::spi_mem_regs::Reg<'a, #spec> {
                unsafe { ::spi_mem_regs::Reg::__MACRO_ONLY__from_ptr(::core::ptr::addr_of_mut!((*self.as_ptr()).#name)) }
            }
        ),
        Type::Array(TypeArray { elem, len, .. }) if is_u32(elem) => {
            let len: &Expr = len;
            quote!(
                #doc
                #[inline]
                pub fn #name (&self) -> ::spi_mem_regs::RegArray<'a, #spec, {#len}> {
                    unsafe { ::spi_mem_regs::RegArray::__MACRO_ONLY__from_ptr(::core::ptr::addr_of_mut!((*self.as_ptr()).#name)) }
                }
            )
        }
        ty => bail!(
            ty,
            "RegMap derive supports only `u32` and `[u32; N]` register fields"
        ),
    };
    Ok(Some(RegField { method, check }))
}

fn parse_docs(field: &syn::Field) -> Result<proc_macro2::TokenStream> {
    let mut docs = quote!();
    for attr in &field.attrs {
        if attr.path().is_ident("doc") {
            let text = &attr.meta.require_name_value()?.value;
            docs.extend(quote!(#[doc = #text]));
        }
    }
    Ok(docs)
}
