// Declarative generators for schema objects.
//
// Every object serializes as `constructor id ‖ fields in order`; boxed
// enums dispatch on the peeked id.

macro_rules! tl_object {
    (
        $(#[$meta:meta])*
        $name:ident = $id:literal {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl $crate::Identifiable for $name {
            const CONSTRUCTOR_ID: u32 = $id;
        }

        impl $crate::Serializable for $name {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                $crate::Serializable::serialize(&<Self as $crate::Identifiable>::CONSTRUCTOR_ID, buf);
                $( $crate::Serializable::serialize(&self.$field, buf); )*
            }
        }

        impl $crate::Deserializable for $name {
            fn deserialize(buf: $crate::deserialize::Buffer) -> $crate::deserialize::Result<Self> {
                buf.expect_constructor($id)?;
                $( let $field = <$ty as $crate::Deserializable>::deserialize(buf)?; )*
                Ok(Self { $( $field, )* })
            }
        }
    };
}

macro_rules! tl_function {
    (
        $(#[$meta:meta])*
        $name:ident = $id:literal -> $ret:ty {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl $crate::Identifiable for $name {
            const CONSTRUCTOR_ID: u32 = $id;
        }

        impl $crate::Serializable for $name {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                $crate::Serializable::serialize(&<Self as $crate::Identifiable>::CONSTRUCTOR_ID, buf);
                $( $crate::Serializable::serialize(&self.$field, buf); )*
            }
        }

        impl $crate::RemoteCall for $name {
            type Return = $ret;
        }

        #[cfg(feature = "deserializable-functions")]
        impl $crate::Deserializable for $name {
            fn deserialize(buf: $crate::deserialize::Buffer) -> $crate::deserialize::Result<Self> {
                buf.expect_constructor($id)?;
                $( let $field = <$ty as $crate::Deserializable>::deserialize(buf)?; )*
                Ok(Self { $( $field, )* })
            }
        }
    };
}

macro_rules! tl_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $( $variant:ident ( $ty:path ) ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub enum $name {
            $( $variant($ty), )+
        }

        impl $crate::Serializable for $name {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                match self {
                    $( Self::$variant(x) => $crate::Serializable::serialize(x, buf), )+
                }
            }
        }

        impl $crate::Deserializable for $name {
            fn deserialize(buf: $crate::deserialize::Buffer) -> $crate::deserialize::Result<Self> {
                let id = buf.peek_u32()?;
                $(
                    if id == <$ty as $crate::Identifiable>::CONSTRUCTOR_ID {
                        return Ok(Self::$variant(<$ty as $crate::Deserializable>::deserialize(buf)?));
                    }
                )+
                Err($crate::deserialize::Error::UnexpectedConstructor { id })
            }
        }

        $(
            impl From<$ty> for $name {
                fn from(x: $ty) -> Self { Self::$variant(x) }
            }
        )+
    };
}
