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

//! Deep-clone of an arbitrary pointer from one message into another.
//!
//! Structs keep their exact `(data_words, ptr_words)` layout, primitive
//! lists are bulk-copied, pointer and struct lists recurse per element,
//! and capabilities are re-emitted with the same capability-table index.
//! The source reader's traversal and nesting limits bound the copy.

use crate::any_pointer;
use crate::layout::{PointerBuilder, PointerReader, StructBuilder, StructReader};
use crate::ptr::{ElementSize, PointerKind};
use crate::{Error, Result};

/// Copies the pointer subgraph under `src` into the slot `dst`.
pub fn clone_any_pointer(src: &any_pointer::Reader<'_>, dst: any_pointer::Builder<'_>) -> Result<()> {
    deep_copy_pointer(&src.pointer_reader(), dst.into_pointer_builder())
}

pub(crate) fn deep_copy_pointer(src: &PointerReader<'_>, mut dst: PointerBuilder<'_>) -> Result<()> {
    match src.resolved_kind()? {
        None => {
            dst.clear();
            Ok(())
        }
        Some(PointerKind::Capability) => {
            dst.set_capability(src.get_capability()?);
            Ok(())
        }
        Some(PointerKind::Struct) => {
            let reader = src.get_struct()?;
            let mut builder = dst.init_struct(reader.data_words(), reader.ptr_words());
            copy_struct(&reader, &mut builder)
        }
        Some(PointerKind::List) => {
            let reader = src.get_list(None)?;
            match reader.element_size() {
                ElementSize::Pointer => {
                    let mut builder = dst.init_list(ElementSize::Pointer, reader.len())?;
                    for i in 0..reader.len() {
                        deep_copy_pointer(
                            &reader.get_pointer_element(i)?,
                            builder.get_pointer_element(i)?,
                        )?;
                    }
                    Ok(())
                }
                ElementSize::InlineComposite => {
                    let (data_words, ptr_words) = reader.struct_sizes();
                    let mut builder =
                        dst.init_struct_list(reader.len(), data_words, ptr_words)?;
                    for i in 0..reader.len() {
                        let element = reader.get_struct_element(i)?;
                        let mut target = builder.get_struct_element(i)?;
                        copy_struct(&element, &mut target)?;
                    }
                    Ok(())
                }
                elem => {
                    let mut builder = dst.init_list(elem, reader.len())?;
                    builder.copy_raw_bytes(reader.raw_bytes());
                    Ok(())
                }
            }
        }
        // resolve() never yields a far pointer: landing pads are followed.
        Some(PointerKind::Far) => Err(Error::invalid_pointer("unresolvable far pointer")),
    }
}

fn copy_struct(src: &StructReader<'_>, dst: &mut StructBuilder<'_>) -> Result<()> {
    let (segment, offset, len) = dst.data_byte_range();
    debug_assert_eq!(len, src.data_section().len());
    dst.arena_mut().write_bytes(segment, offset, src.data_section());
    for i in 0..src.ptr_words() {
        deep_copy_pointer(&src.get_pointer(i), dst.get_pointer(i)?)?;
    }
    Ok(())
}
