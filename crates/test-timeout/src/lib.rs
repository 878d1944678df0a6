//! Test attributes that fail a test instead of letting it hang.
//!
//! The limit comes from the attribute (`#[timeout(5)]`), defaults to 30
//! seconds, and can be raised for slow CI hosts with
//! `CALL_TEST_TIMEOUT_SECS`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const TIMEOUT_ENV: &str = "CALL_TEST_TIMEOUT_SECS";

fn timeout_secs(attr: TokenStream) -> syn::Result<u64> {
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

fn is_attribute(attr: &Attribute, path: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments == path
}

/// Runs `body` on its own thread and fails the test if it outlives the limit.
fn guarded(secs: u64, body: TokenStream2) -> TokenStream2 {
    let env = TIMEOUT_ENV;
    quote! {
        let limit = std::env::var(#env)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(|value| value.max(#secs))
            .unwrap_or(#secs);
        let limit = std::time::Duration::from_secs(limit);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || { #body }));
            let _ = sender.send(outcome);
        });
        match receiver.recv_timeout(limit) {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded {:?}", limit)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting")
            }
        }
    }
}

/// Async test on a fresh current-thread Tokio runtime, bounded by a timeout.
/// Replaces `#[tokio::test]`.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match timeout_secs(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);
    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test needs an async fn")
            .to_compile_error()
            .into();
    }
    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_attribute(attr, &["tokio", "test"]))
        .collect();

    let body = guarded(
        secs,
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("build tokio runtime");
            runtime.block_on(async move #block);
        },
    );
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    }
    .into()
}

/// Synchronous test bounded by a timeout. Replaces `#[test]`.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match timeout_secs(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);
    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(&sig.ident, "use tokio_timeout_test for async tests")
            .to_compile_error()
            .into();
    }
    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_attribute(attr, &["test"]))
        .collect();

    let body = guarded(secs, quote! { #block; });
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    }
    .into()
}
