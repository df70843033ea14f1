//! Watchdog attributes for tests that drive transports and event
//! loops: a hung test fails with a timeout panic instead of wedging
//! the whole run.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Wraps an async test in a current-thread Tokio runtime with a
/// watchdog. Optional argument: timeout in seconds.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = parse_timeout(attr);
    let mut test = parse_macro_input!(item as ItemFn);
    if test.sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(
            &test.sig.ident,
            "tokio_timeout_test expects an async function",
        )
        .to_compile_error()
        .into();
    }
    let block = &test.block;
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(std::time::Duration::from_secs(#secs), async move #block)
                .await
                .expect("test timed out");
        });
    };
    emit(test, secs, body)
}

/// Wraps a blocking test in a watchdog thread. Optional argument:
/// timeout in seconds.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = parse_timeout(attr);
    let test = parse_macro_input!(item as ItemFn);
    if test.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &test.sig.ident,
            "timeout expects a synchronous function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    let block = &test.block;
    let body = quote! { #block };
    emit(test, secs, body)
}

fn parse_timeout(attr: TokenStream) -> u64 {
    if attr.is_empty() {
        return DEFAULT_TIMEOUT_SECS;
    }
    let lit: LitInt = match syn::parse(attr) {
        Ok(lit) => lit,
        Err(err) => panic!("invalid timeout argument: {err}"),
    };
    let secs: u64 = lit
        .base10_parse()
        .unwrap_or_else(|err| panic!("invalid timeout value: {err}"));
    if secs == 0 {
        panic!("timeout must be greater than zero");
    }
    secs
}

fn emit(test: ItemFn, secs: u64, body: TokenStream2) -> TokenStream {
    let ItemFn {
        attrs, vis, sig, ..
    } = test;
    let kept_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    TokenStream::from(quote! {
        #[test]
        #(#kept_attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(limit) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(_) => panic!("test exceeded {}s watchdog", #secs),
            }
        }
    })
}

fn is_test_marker(attr: &Attribute) -> bool {
    let path = attr.path();
    path.is_ident("test")
        || path
            .segments
            .iter()
            .map(|segment| segment.ident.to_string())
            .collect::<Vec<_>>()
            == ["tokio", "test"]
}
