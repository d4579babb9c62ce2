//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[tokio_timeout_test]` runs an async test body on its own runtime in a
//! separate thread; `#[timeout]` does the same for synchronous tests. Both take
//! an optional limit in seconds (default 30), and the async form accepts
//! `multi_thread` for tests that need more than one worker.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{Attribute, Ident, ItemFn, LitInt, Token, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

struct TimeoutArgs {
    secs: u64,
    multi_thread: bool,
}

enum TimeoutArg {
    Secs(LitInt),
    Flag(Ident),
}

impl Parse for TimeoutArg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            input.parse().map(TimeoutArg::Secs)
        } else {
            input.parse().map(TimeoutArg::Flag)
        }
    }
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            multi_thread: false,
        };
        for arg in Punctuated::<TimeoutArg, Token![,]>::parse_terminated(input)? {
            match arg {
                TimeoutArg::Secs(lit) => {
                    args.secs = lit.base10_parse()?;
                    if args.secs == 0 {
                        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                    }
                }
                TimeoutArg::Flag(flag) if flag == "multi_thread" => args.multi_thread = true,
                TimeoutArg::Flag(flag) => {
                    return Err(syn::Error::new_spanned(flag, "expected a number of seconds or `multi_thread`"));
                }
            }
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_path(attr, &["tokio", "test"]) && !is_path(attr, &["test"]))
        .collect();
    let builder = if args.multi_thread {
        quote!(tokio::runtime::Builder::new_multi_thread().worker_threads(2))
    } else {
        quote!(tokio::runtime::Builder::new_current_thread())
    };

    let body = quote! {
        let runtime = #builder
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    };
    expand(attrs, vis, sig, args.secs, body)
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous test; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_path(attr, &["test"]))
        .collect();
    let body = quote!(#block);
    expand(attrs, vis, sig, args.secs, body)
}

/// Wraps `body` in a watchdog: it runs on a spawned thread and the test fails
/// if no result arrives in time. Panics inside the body are re-raised.
fn expand(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    secs: u64,
    body: TokenStream2,
) -> TokenStream {
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {:?}", timeout_duration)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_path(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<_> = attr.path().segments.iter().collect();
    segments.len() == expected.len()
        && segments
            .iter()
            .zip(expected)
            .all(|(segment, name)| segment.ident == name)
}
