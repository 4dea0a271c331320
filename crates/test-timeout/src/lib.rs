//! Test attributes that fail a test once it runs past a wall-clock budget
//! instead of letting a stuck negotiation hang the whole suite.
//!
//! `#[test_timeout::timeout(5)]` wraps a synchronous test and
//! `#[test_timeout::tokio_timeout_test(5)]` wraps an async one in a
//! current-thread runtime with time enabled. The budget defaults to 60s.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, Block, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

fn parse_budget(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

fn strip_attrs(attrs: Vec<Attribute>, path: &[&str]) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            segments != path
        })
        .collect()
}

/// Run `body` on a watchdog thread and fail if it has not reported back
/// within `secs`. Panics inside the body are re-raised on the test thread.
fn guarded(body: TokenStream2, secs: u64) -> TokenStream2 {
    quote! {
        let budget = ::std::time::Duration::from_secs(#secs);
        let (report, outcome) = ::std::sync::mpsc::channel();
        ::std::thread::spawn(move || {
            let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| { #body }));
            let _ = report.send(result);
        });
        match outcome.recv_timeout(budget) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
            Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded its {}s budget", #secs)
            }
            Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting")
            }
        }
    }
}

fn expand(item: ItemFn, secs: u64, body: TokenStream2, strip: &[&str]) -> TokenStream2 {
    let ItemFn { attrs, vis, sig, .. } = item;
    let attrs = strip_attrs(attrs, strip);
    let guarded = guarded(body, secs);
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    }
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_budget(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let item = parse_macro_input!(item as ItemFn);
    if let Some(token) = item.sig.asyncness {
        return syn::Error::new_spanned(token, "use tokio_timeout_test for async tests")
            .to_compile_error()
            .into();
    }
    let block: &Block = &item.block;
    let body = quote! { #block };
    expand(item.clone(), secs, body, &["test"]).into()
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_budget(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut item = parse_macro_input!(item as ItemFn);
    if item.sig.asyncness.is_none() {
        return syn::Error::new_spanned(&item.sig.ident, "tokio_timeout_test expects an async fn")
            .to_compile_error()
            .into();
    }
    item.sig.asyncness = None;
    let block = item.block.clone();
    let body = quote! {
        ::tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build tokio runtime")
            .block_on(async move {
                ::tokio::time::timeout(::std::time::Duration::from_secs(#secs), async move #block)
                    .await
                    .expect("test exceeded its budget");
            })
    };
    expand(item, secs, body, &["tokio", "test"]).into()
}
