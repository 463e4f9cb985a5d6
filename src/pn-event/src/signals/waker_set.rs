use std::{any::Any, any::TypeId, fmt, marker::PhantomData};

// === Waker === //

pub trait Waker: 'static + Send + Sync {
    fn wake(&self);
}

// === WakerSet === //

/// A fixed, named collection of [`Waker`]s that a [`RawSignalChannel`](crate::RawSignalChannel)
/// can hand off to when it needs to rouse its single active listener. Implemented by
/// [`define_waker_set!`].
pub trait WakerSet: 'static + Send + Sync {
    fn index_of(&self, id: TypeId) -> Option<u32>;

    fn state_of(&self, id: TypeId) -> Option<&dyn Any>;

    fn wake(&self, index: u32);

    fn name_of(&self, index: u32) -> Option<&'static str>;
}

/// Marker implemented for every `(WakerSet, Waker)` pair generated by [`define_waker_set!`],
/// carrying the compile-time-known index of `T` within the set.
pub trait WakerSetHas<T: Waker>: WakerSet {
    const INDEX: u32;
}

// === WakerIndex === //

pub struct WakerIndex<W: ?Sized + WakerSet> {
    index: u32,
    _ty: PhantomData<fn() -> W>,
}

impl<W: ?Sized + WakerSet> fmt::Debug for WakerIndex<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WakerIndex").field(&self.index).finish()
    }
}

impl<W: ?Sized + WakerSet> Copy for WakerIndex<W> {}

impl<W: ?Sized + WakerSet> Clone for WakerIndex<W> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<W: ?Sized + WakerSet> WakerIndex<W> {
    pub fn new_unchecked(index: u32) -> Self {
        Self {
            index,
            _ty: PhantomData,
        }
    }

    pub fn of<T: Waker>() -> Self
    where
        W: WakerSetHas<T>,
    {
        Self::new_unchecked(W::INDEX)
    }

    pub fn index(self) -> u32 {
        self.index
    }
}

// === define_waker_set! === //

/// Declares a struct whose fields are each a distinct [`Waker`] implementation and wires it up
/// as a [`WakerSet`], plus a [`WakerSetHas`] impl for every field's type so that
/// `WakerIndex::of::<FieldType>()` resolves without runtime lookup.
#[macro_export]
macro_rules! define_waker_set {
    (
        $(#[$attr:meta])*
        $vis:vis struct $name:ident {
            $($field:ident : $ty:ty),* $(,)?
        }
    ) => {
        $(#[$attr])*
        $vis struct $name {
            $($field: $ty,)*
        }

        impl $crate::WakerSet for $name {
            fn index_of(&self, id: ::std::any::TypeId) -> ::std::option::Option<u32> {
                #[allow(unused_mut, unused_assignments)]
                let mut index = 0u32;
                $(
                    if id == ::std::any::TypeId::of::<$ty>() {
                        return ::std::option::Option::Some(index);
                    }
                    #[allow(unused_assignments)]
                    { index += 1; }
                )*
                ::std::option::Option::None
            }

            fn state_of(&self, id: ::std::any::TypeId) -> ::std::option::Option<&dyn ::std::any::Any> {
                $(
                    if id == ::std::any::TypeId::of::<$ty>() {
                        return ::std::option::Option::Some(&self.$field as &dyn ::std::any::Any);
                    }
                )*
                ::std::option::Option::None
            }

            fn wake(&self, index: u32) {
                #[allow(unused_mut, unused_assignments)]
                let mut i = 0u32;
                $(
                    if i == index {
                        $crate::Waker::wake(&self.$field);
                        return;
                    }
                    #[allow(unused_assignments)]
                    { i += 1; }
                )*
            }

            fn name_of(&self, index: u32) -> ::std::option::Option<&'static str> {
                #[allow(unused_mut, unused_assignments)]
                let mut i = 0u32;
                $(
                    if i == index {
                        return ::std::option::Option::Some(::std::stringify!($field));
                    }
                    #[allow(unused_assignments)]
                    { i += 1; }
                )*
                ::std::option::Option::None
            }
        }

        $crate::__define_waker_set_has! { $name; 0; $($field: $ty,)* }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __define_waker_set_has {
    ($name:ident; $index:expr; $field:ident : $ty:ty, $($rest:tt)*) => {
        impl $crate::WakerSetHas<$ty> for $name {
            const INDEX: u32 = $index;
        }

        $crate::__define_waker_set_has! { $name; $index + 1; $($rest)* }
    };

    ($name:ident; $index:expr;) => {};
}
