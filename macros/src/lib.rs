use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Error, ItemFn, LitStr, parse_macro_input, spanned::Spanned};

/// Publishes a function in the host symbol table that loaded images bind
/// their imports against.
///
/// The function keeps its body and gains C linkage under a `websynth_`
/// prefixed link name; the table maps the import name to that function.
/// The import name defaults to the function name and can be given
/// explicitly with `#[host_symbol(name = "...")]`.
///
/// Mach-O images spell imports with a leading underscore, which the binder
/// strips before the lookup, so names in the table never carry it.
///
/// ```ignore
/// #[host_symbol]
/// pub fn x87_fchs_void(cpu: *mut CpuState) { ... }
///
/// // becomes
///
/// #[unsafe(no_mangle)]
/// pub extern "C" fn websynth_x87_fchs_void(cpu: *mut CpuState) { ... }
///
/// #[linkme::distributed_slice(crate::symbols::HOST_SYMBOLS)]
/// static _HOST_SYMBOL_X87_FCHS_VOID: (&str, FnPtr) = ("x87_fchs_void", ...);
/// ```
#[proc_macro_attribute]
pub fn host_symbol(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut import_name: Option<LitStr> = None;
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("name") {
            import_name = Some(meta.value()?.parse()?);
            Ok(())
        } else {
            Err(meta.error("expected `name = \"...\"`"))
        }
    });
    parse_macro_input!(attr with parser);

    let input = parse_macro_input!(item as ItemFn);
    match expand(input, import_name) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: ItemFn, import_name: Option<LitStr>) -> syn::Result<proc_macro2::TokenStream> {
    let sig = &input.sig;
    if let Some(asyncness) = &sig.asyncness {
        return Err(Error::new(asyncness.span(), "host symbols cannot be async"));
    }
    if !sig.generics.params.is_empty() {
        return Err(Error::new(sig.generics.span(), "host symbols cannot be generic"));
    }
    if let Some(variadic) = &sig.variadic {
        return Err(Error::new(variadic.span(), "host symbols cannot be variadic"));
    }
    if let Some(abi) = &sig.abi {
        return Err(Error::new(abi.span(), "the C ABI is added by #[host_symbol]"));
    }

    let ident = &sig.ident;
    let link_name = format_ident!("websynth_{}", ident);
    let table_name = match import_name {
        Some(lit) => lit.value(),
        None => ident.to_string(),
    };
    if table_name.is_empty() || table_name.starts_with('_') {
        return Err(Error::new(
            ident.span(),
            "import names are stored without a leading underscore",
        ));
    }
    let entry = format_ident!("_HOST_SYMBOL_{}", ident.to_string().to_uppercase());

    let attrs = &input.attrs;
    let vis = &input.vis;
    let unsafety = &sig.unsafety;
    let inputs = &sig.inputs;
    let output = &sig.output;
    let block = &input.block;

    Ok(quote! {
        #(#attrs)*
        #[unsafe(no_mangle)]
        #vis #unsafety extern "C" fn #link_name(#inputs) #output #block

        #[linkme::distributed_slice(crate::symbols::HOST_SYMBOLS)]
        static #entry: (&str, crate::symbols::FnPtr) =
            (#table_name, crate::symbols::FnPtr(#link_name as *const ()));
    })
}
