// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! List of primitives.

use core::marker;

use crate::layout::{ListBuilder, ListReader};
use crate::ptr::ElementSize;

/// A fixed-width value that can live in a primitive list.
pub trait PrimitiveElement: Copy {
    const ELEMENT_SIZE: ElementSize;

    fn get(list: &ListReader<'_>, index: u32) -> Self;
    fn set(list: &mut ListBuilder<'_>, index: u32, value: Self);
}

macro_rules! primitive_element {
    ($t:ty, $size:ident) => {
        impl PrimitiveElement for $t {
            const ELEMENT_SIZE: ElementSize = ElementSize::$size;

            fn get(list: &ListReader<'_>, index: u32) -> Self {
                <$t>::from_le_bytes(
                    list.primitive_bytes(index, core::mem::size_of::<$t>())
                        .try_into()
                        .unwrap(),
                )
            }

            fn set(list: &mut ListBuilder<'_>, index: u32, value: Self) {
                list.set_primitive_bytes(index, &value.to_le_bytes());
            }
        }
    };
}

primitive_element!(u8, Byte);
primitive_element!(u16, TwoBytes);
primitive_element!(u32, FourBytes);
primitive_element!(u64, EightBytes);
primitive_element!(i8, Byte);
primitive_element!(i16, TwoBytes);
primitive_element!(i32, FourBytes);
primitive_element!(i64, EightBytes);
primitive_element!(f32, FourBytes);
primitive_element!(f64, EightBytes);

impl PrimitiveElement for bool {
    const ELEMENT_SIZE: ElementSize = ElementSize::Bit;

    fn get(list: &ListReader<'_>, index: u32) -> Self {
        list.get_bool_element(index)
    }

    fn set(list: &mut ListBuilder<'_>, index: u32, value: Self) {
        list.set_bool_element(index, value);
    }
}

/// Void lists carry only a count.
impl PrimitiveElement for () {
    const ELEMENT_SIZE: ElementSize = ElementSize::Void;

    fn get(_list: &ListReader<'_>, _index: u32) -> Self {}

    fn set(_list: &mut ListBuilder<'_>, _index: u32, _value: Self) {}
}

pub struct Reader<'a, T>
where
    T: PrimitiveElement,
{
    marker: marker::PhantomData<T>,
    reader: ListReader<'a>,
}

impl<T: PrimitiveElement> core::fmt::Debug for Reader<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("primitive_list::Reader")
            .field("reader", &self.reader)
            .finish()
    }
}

impl<T: PrimitiveElement> Copy for Reader<'_, T> {}

impl<T: PrimitiveElement> Clone for Reader<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T: PrimitiveElement> Reader<'a, T> {
    pub(crate) fn new(reader: ListReader<'a>) -> Self {
        Self {
            marker: marker::PhantomData,
            reader,
        }
    }

    pub fn len(&self) -> u32 {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gets the `T` at position `index`. Panics if `index` is greater than
    /// or equal to `len()`.
    pub fn get(&self, index: u32) -> T {
        assert!(index < self.len());
        PrimitiveElement::get(&self.reader, index)
    }

    /// Gets the `T` at position `index`. Returns `None` if `index` is
    /// greater than or equal to `len()`.
    pub fn try_get(&self, index: u32) -> Option<T> {
        if index < self.len() {
            Some(PrimitiveElement::get(&self.reader, index))
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + 'a {
        let reader = self.reader;
        (0..reader.len()).map(move |i| PrimitiveElement::get(&reader, i))
    }
}

pub struct Builder<'a, T>
where
    T: PrimitiveElement,
{
    marker: marker::PhantomData<T>,
    builder: ListBuilder<'a>,
}

impl<'a, T: PrimitiveElement> Builder<'a, T> {
    pub(crate) fn new(builder: ListBuilder<'a>) -> Self {
        Self {
            marker: marker::PhantomData,
            builder,
        }
    }

    pub fn len(&self) -> u32 {
        self.builder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set(&mut self, index: u32, value: T) {
        assert!(index < self.len());
        PrimitiveElement::set(&mut self.builder, index, value);
    }

    /// Writes every element from `values`. Panics if the lengths differ.
    pub fn set_all(&mut self, values: &[T]) {
        assert_eq!(values.len() as u32, self.len());
        for (i, value) in values.iter().enumerate() {
            PrimitiveElement::set(&mut self.builder, i as u32, *value);
        }
    }

    pub fn reborrow(&mut self) -> Builder<'_, T> {
        Builder {
            marker: marker::PhantomData,
            builder: self.builder.reborrow(),
        }
    }
}
