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

//! List of pointers. Each element is itself a pointer slot with typed
//! sub-getters; element-size compatibility is validated per call.

use crate::any_pointer;
use crate::layout::{ListBuilder, ListReader, StructBuilder, StructReader};
use crate::ptr::ElementSize;
use crate::{primitive_list, text, Result};

#[derive(Clone, Copy)]
pub struct Reader<'a> {
    reader: ListReader<'a>,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(reader: ListReader<'a>) -> Self {
        Self { reader }
    }

    pub fn len(&self) -> u32 {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_any(&self, index: u32) -> Result<any_pointer::Reader<'a>> {
        Ok(any_pointer::Reader::new(
            self.reader.get_pointer_element(index)?,
        ))
    }

    pub fn get_text(&self, index: u32) -> Result<text::Reader<'a>> {
        self.reader.get_pointer_element(index)?.get_text()
    }

    pub fn get_data(&self, index: u32) -> Result<&'a [u8]> {
        self.reader.get_pointer_element(index)?.get_data()
    }

    pub fn get_struct(&self, index: u32) -> Result<StructReader<'a>> {
        self.reader.get_pointer_element(index)?.get_struct()
    }

    pub fn get_capability(&self, index: u32) -> Result<u32> {
        self.reader.get_pointer_element(index)?.get_capability()
    }

    pub fn get_primitive_list<T: primitive_list::PrimitiveElement>(
        &self,
        index: u32,
    ) -> Result<primitive_list::Reader<'a, T>> {
        Ok(primitive_list::Reader::new(
            self.reader
                .get_pointer_element(index)?
                .get_list(Some(T::ELEMENT_SIZE))?,
        ))
    }

    pub fn get_struct_list(&self, index: u32) -> Result<crate::struct_list::Reader<'a>> {
        Ok(crate::struct_list::Reader::new(
            self.reader
                .get_pointer_element(index)?
                .get_list(Some(ElementSize::InlineComposite))?,
        ))
    }
}

pub struct Builder<'a> {
    builder: ListBuilder<'a>,
}

impl<'a> Builder<'a> {
    pub(crate) fn new(builder: ListBuilder<'a>) -> Self {
        Self { builder }
    }

    pub fn len(&self) -> u32 {
        self.builder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_any(&mut self, index: u32) -> Result<any_pointer::Builder<'_>> {
        Ok(any_pointer::Builder::new(
            self.builder.get_pointer_element(index)?,
        ))
    }

    pub fn init_element_text(&mut self, index: u32, value: &str) -> Result<()> {
        self.builder.get_pointer_element(index)?.set_text(value)
    }

    pub fn init_element_data(&mut self, index: u32, value: &[u8]) -> Result<()> {
        self.builder.get_pointer_element(index)?.set_data(value)
    }

    pub fn init_element_struct(
        &mut self,
        index: u32,
        data_words: u16,
        ptr_words: u16,
    ) -> Result<StructBuilder<'_>> {
        Ok(self
            .builder
            .get_pointer_element(index)?
            .init_struct(data_words, ptr_words))
    }

    pub fn set_element_capability(&mut self, index: u32, cap: u32) -> Result<()> {
        self.builder.get_pointer_element(index)?.set_capability(cap);
        Ok(())
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            builder: self.builder.reborrow(),
        }
    }
}
