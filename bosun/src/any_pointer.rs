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

//! Dynamically typed access to one pointer slot.

use crate::layout::{
    ListBuilder, ListReader, PointerBuilder, PointerReader, StructBuilder, StructReader,
};
use crate::ptr::{ElementSize, PointerKind};
use crate::{pointer_list, primitive_list, struct_list, text, Result};

/// One selector in a promised-answer transform: descend into a struct's
/// pointer field or into a pointer list's element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineOp {
    Noop,
    GetPointerField(u16),
    GetListElement(u32),
}

#[derive(Clone, Copy)]
pub struct Reader<'a> {
    pointer: PointerReader<'a>,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(pointer: PointerReader<'a>) -> Self {
        Self { pointer }
    }

    pub fn is_null(&self) -> bool {
        self.pointer.is_null()
    }

    /// The kind of the pointer after far resolution, or `None` for null.
    pub fn kind(&self) -> Result<Option<PointerKind>> {
        self.pointer.resolved_kind()
    }

    pub fn get_struct(&self) -> Result<StructReader<'a>> {
        self.pointer.get_struct()
    }

    pub fn get_list(&self, expected: Option<ElementSize>) -> Result<ListReader<'a>> {
        self.pointer.get_list(expected)
    }

    pub fn get_text(&self) -> Result<text::Reader<'a>> {
        self.pointer.get_text()
    }

    pub fn get_data(&self) -> Result<&'a [u8]> {
        self.pointer.get_data()
    }

    pub fn get_capability(&self) -> Result<u32> {
        self.pointer.get_capability()
    }

    pub fn get_primitive_list<T: primitive_list::PrimitiveElement>(
        &self,
    ) -> Result<primitive_list::Reader<'a, T>> {
        Ok(primitive_list::Reader::new(
            self.pointer.get_list(Some(T::ELEMENT_SIZE))?,
        ))
    }

    pub fn get_struct_list(&self) -> Result<struct_list::Reader<'a>> {
        Ok(struct_list::Reader::new(
            self.pointer.get_list(Some(ElementSize::InlineComposite))?,
        ))
    }

    pub fn get_pointer_list(&self) -> Result<pointer_list::Reader<'a>> {
        Ok(pointer_list::Reader::new(
            self.pointer.get_list(Some(ElementSize::Pointer))?,
        ))
    }

    /// Descends into pointer field `index` of the struct this pointer
    /// targets.
    pub fn get_pointer_field(&self, index: u16) -> Result<Reader<'a>> {
        Ok(Self::new(self.get_struct()?.get_pointer(index)))
    }

    /// Descends into element `index` of the pointer list this pointer
    /// targets.
    pub fn get_list_element(&self, index: u32) -> Result<Reader<'a>> {
        Ok(Self::new(
            self.get_list(Some(ElementSize::Pointer))?
                .get_pointer_element(index)?,
        ))
    }

    /// Applies a promised-answer transform to this pointer.
    pub fn apply_pipeline_ops(&self, ops: &[PipelineOp]) -> Result<Reader<'a>> {
        let mut current = *self;
        for op in ops {
            current = match *op {
                PipelineOp::Noop => current,
                PipelineOp::GetPointerField(index) => current.get_pointer_field(index)?,
                PipelineOp::GetListElement(index) => current.get_list_element(index)?,
            };
        }
        Ok(current)
    }

    pub(crate) fn pointer_reader(&self) -> PointerReader<'a> {
        self.pointer
    }
}

pub struct Builder<'a> {
    pointer: PointerBuilder<'a>,
}

impl<'a> Builder<'a> {
    pub(crate) fn new(pointer: PointerBuilder<'a>) -> Self {
        Self { pointer }
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            pointer: self.pointer.reborrow(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.pointer.is_null()
    }

    pub fn clear(&mut self) {
        self.pointer.clear();
    }

    pub fn init_struct(self, data_words: u16, ptr_words: u16) -> StructBuilder<'a> {
        self.pointer.init_struct(data_words, ptr_words)
    }

    pub fn init_list(self, elem: ElementSize, count: u32) -> Result<ListBuilder<'a>> {
        self.pointer.init_list(elem, count)
    }

    pub fn init_primitive_list<T: primitive_list::PrimitiveElement>(
        self,
        count: u32,
    ) -> Result<primitive_list::Builder<'a, T>> {
        Ok(primitive_list::Builder::new(
            self.pointer.init_list(T::ELEMENT_SIZE, count)?,
        ))
    }

    pub fn init_struct_list(
        self,
        count: u32,
        data_words: u16,
        ptr_words: u16,
    ) -> Result<struct_list::Builder<'a>> {
        Ok(struct_list::Builder::new(self.pointer.init_struct_list(
            count,
            data_words,
            ptr_words,
        )?))
    }

    pub fn init_pointer_list(self, count: u32) -> Result<pointer_list::Builder<'a>> {
        Ok(pointer_list::Builder::new(
            self.pointer.init_list(ElementSize::Pointer, count)?,
        ))
    }

    pub fn set_text(self, value: &str) -> Result<()> {
        self.pointer.set_text(value)
    }

    pub fn set_data(self, value: &[u8]) -> Result<()> {
        self.pointer.set_data(value)
    }

    pub fn set_capability(&mut self, index: u32) {
        self.pointer.set_capability(index);
    }

    /// Sets this pointer to a deep copy of `value`.
    pub fn set_as(self, value: &Reader<'_>) -> Result<()> {
        crate::copy::deep_copy_pointer(&value.pointer_reader(), self.pointer)
    }

    pub(crate) fn into_pointer_builder(self) -> PointerBuilder<'a> {
        self.pointer
    }
}
