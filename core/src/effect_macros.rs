//! Declarative macros for ergonomic effect construction
//!
//! These macros reduce boilerplate when creating `Effect` variants, particularly
//! for the fire-and-forget side channels of the checkout flow.

/// Create an `Effect::Future` from an async block
///
/// # Example
///
/// ```rust,ignore
/// use vending_core::async_effect;
///
/// async_effect! {
///     let rows = machine.reserve(&order_id, quantity).await.ok()?;
///     Some(CheckoutAction::ReservationCompleted { order_id, rows })
/// }
/// ```
#[macro_export]
macro_rules! async_effect {
    ($($body:tt)*) => {
        $crate::effect::Effect::Future(
            ::std::boxed::Box::pin(async move { $($body)* })
        )
    };
}

/// Create a detached `Effect::Future` that never feeds an action back
///
/// The body is awaited for its side effect only; its value is discarded.
///
/// # Example
///
/// ```rust,ignore
/// use vending_core::detached_effect;
///
/// detached_effect! {
///     sync_machine_status(machine, update).await;
/// }
/// ```
#[macro_export]
macro_rules! detached_effect {
    ($($body:tt)*) => {
        $crate::effect::Effect::Future(
            ::std::boxed::Box::pin(async move {
                $($body)*
                None
            })
        )
    };
}
