//! Encode lowering. Measure shares the walk through the [`Output`] trait.

use std::sync::Arc;

use crate::error::CompileError;
use crate::ir::{Cond, Reg, Width};
use crate::runtime;
use crate::schema::{Field, Kind, Requiredness, TypeDescriptor};
use crate::wire;

use super::{Lowering, header_tag, is_simple};

/// How bytes reach the wire: written (encode) or only counted (measure).
pub(super) trait Output {
    /// Room for `n` more bytes.
    fn reserve(&self, lw: &mut Lowering<'_>, n: u32);
    fn reserve_reg(&self, lw: &mut Lowering<'_>, len: Reg);
    fn imm(&self, lw: &mut Lowering<'_>, width: Width, value: u64);
    fn int(&self, lw: &mut Lowering<'_>, width: Width, src: Reg);
    fn bytes(&self, lw: &mut Lowering<'_>, src: Reg, len: Reg);
    /// Accounts for `count` elements of `size` bytes each without a loop.
    /// Returns false if the caller must loop instead.
    fn fixed_run(&self, lw: &mut Lowering<'_>, count: Reg, size: u32) -> bool;
}

pub(super) struct WireWriter;

impl Output for WireWriter {
    fn reserve(&self, lw: &mut Lowering<'_>, n: u32) {
        lw.b.check(n);
    }

    fn reserve_reg(&self, lw: &mut Lowering<'_>, len: Reg) {
        lw.b.check_reg(len);
    }

    fn imm(&self, lw: &mut Lowering<'_>, width: Width, value: u64) {
        lw.b.write_imm(width, value);
    }

    fn int(&self, lw: &mut Lowering<'_>, width: Width, src: Reg) {
        lw.b.write_int(width, src);
    }

    fn bytes(&self, lw: &mut Lowering<'_>, src: Reg, len: Reg) {
        lw.b.write_bytes(src, len);
    }

    fn fixed_run(&self, _lw: &mut Lowering<'_>, _count: Reg, _size: u32) -> bool {
        false
    }
}

fn scalar_width(ty: &TypeDescriptor) -> Result<Width, CompileError> {
    Width::from_bytes(ty.size)
        .ok_or_else(|| CompileError::Unsupported(format!("{} has no scalar width", ty.name)))
}

impl Lowering<'_> {
    fn put_header(&mut self, out: &dyn Output, field: &Field) {
        out.reserve(self, 3);
        out.imm(self, Width::W1, header_tag(field) as u64);
        out.imm(self, Width::W2, field.id as u64);
    }

    fn put_stop(&mut self, out: &dyn Output) {
        out.reserve(self, 1);
        out.imm(self, Width::W1, wire::STOP as u64);
    }

    /// Encodes the struct at `p0`. Clobbers every register.
    pub(super) fn enc_struct(&mut self, ty: &Arc<TypeDescriptor>, out: &dyn Output) -> Result<(), CompileError> {
        let framed = ty.fields.iter().any(|f| !is_simple(&f.ty));
        if framed {
            self.b.enter();
            self.b.store_frame(Reg::P0, 0);
        }
        let mut clobbered = false;
        for field in &ty.fields {
            if clobbered {
                self.b.load_frame(Reg::P0, 0);
            }
            self.enc_field(field, out)?;
            clobbered = !is_simple(&field.ty);
        }
        self.put_stop(out);
        if framed {
            self.b.leave();
        }
        Ok(())
    }

    fn enc_field(&mut self, field: &Field, out: &dyn Output) -> Result<(), CompileError> {
        let skip = self.b.label();
        let ty = &field.ty;
        let off = field.offset;

        if field.is_boxed() {
            self.b.load_ptr(Reg::P2, Reg::P0, off);
            self.b.branch_imm(Cond::Eq, Reg::P2, 0, skip);
            self.put_header(out, field);
            self.enc_scalar(ty, Reg::P2, 0, out)?;
        } else if ty.kind.is_scalar() {
            if let Some(default) = field.default {
                let width = scalar_width(ty)?;
                self.b.load(width, false, Reg::R0, Reg::P0, off);
                let bits = default.raw_bits();
                match i32::try_from(bits) {
                    Ok(imm) => self.b.branch_imm(Cond::Eq, Reg::R0, imm, skip),
                    Err(_) => {
                        self.b.mov_imm(Reg::R2, bits);
                        self.b.branch_reg(Cond::Eq, Reg::R0, Reg::R2, skip);
                    }
                }
            }
            self.put_header(out, field);
            self.enc_scalar(ty, Reg::P0, off, out)?;
        } else if ty.kind == Kind::Pointer {
            self.b.load_ptr(Reg::P2, Reg::P0, off);
            if field.requiredness == Requiredness::Required {
                let present = self.b.label();
                self.b.branch_imm(Cond::Ne, Reg::P2, 0, present);
                self.put_header(out, field);
                self.put_stop(out);
                self.b.jump(skip);
                self.b.bind(present);
            } else {
                self.b.branch_imm(Cond::Eq, Reg::P2, 0, skip);
            }
            self.put_header(out, field);
            self.b.seek(Reg::P0, Reg::P2, 0);
            self.nested_struct(ty, |lw, t| lw.enc_struct(t, out))?;
        } else if ty.kind == Kind::Struct {
            self.put_header(out, field);
            self.b.seek(Reg::P0, Reg::P0, off as i32);
            self.nested_struct(ty, |lw, t| lw.enc_struct(t, out))?;
        } else {
            // Strings, binaries and containers: nil means absent unless required.
            if field.requiredness != Requiredness::Required {
                self.b.load_ptr(Reg::P2, Reg::P0, off);
                self.b.branch_imm(Cond::Eq, Reg::P2, 0, skip);
            }
            self.put_header(out, field);
            self.enc_value(ty, Reg::P0, off, out)?;
        }

        self.b.bind(skip);
        Ok(())
    }

    fn enc_scalar(&mut self, ty: &TypeDescriptor, base: Reg, off: u32, out: &dyn Output) -> Result<(), CompileError> {
        let width = scalar_width(ty)?;
        out.reserve(self, width.bytes());
        self.b.load(width, false, Reg::R0, base, off);
        out.int(self, width, Reg::R0);
        Ok(())
    }

    /// Encodes the value of type `ty` at `base + off`.
    fn enc_value(&mut self, ty: &Arc<TypeDescriptor>, base: Reg, off: u32, out: &dyn Output) -> Result<(), CompileError> {
        match ty.kind {
            k if k.is_scalar() => self.enc_scalar(ty, base, off, out),
            Kind::String | Kind::Binary => {
                self.b.load(Width::W4, false, Reg::R0, base, off + 4);
                out.reserve(self, 4);
                out.int(self, Width::W4, Reg::R0);
                self.b.load_ptr(Reg::P2, base, off);
                out.reserve_reg(self, Reg::R0);
                out.bytes(self, Reg::P2, Reg::R0);
                Ok(())
            }
            Kind::List | Kind::Set | Kind::Map => self.enc_container(ty, base, off, out),
            Kind::Struct => {
                if base != Reg::P0 || off != 0 {
                    self.b.seek(Reg::P0, base, off as i32);
                }
                self.nested_struct(ty, |lw, t| lw.enc_struct(t, out))
            }
            _ => {
                // Pointer element: a nil pointer encodes as an empty struct.
                let present = self.b.label();
                let done = self.b.label();
                self.b.load_ptr(Reg::P0, base, off);
                self.b.branch_imm(Cond::Ne, Reg::P0, 0, present);
                self.put_stop(out);
                self.b.jump(done);
                self.b.bind(present);
                self.nested_struct(ty, |lw, t| lw.enc_struct(t, out))?;
                self.b.bind(done);
                Ok(())
            }
        }
    }

    fn enc_container(&mut self, ty: &Arc<TypeDescriptor>, base: Reg, off: u32, out: &dyn Output) -> Result<(), CompileError> {
        let is_map = ty.kind == Kind::Map;
        let val = ty.elem()?.clone();
        let key = if is_map { Some(ty.map_key()?.clone()) } else { None };
        let (val_off, stride) = if is_map {
            ty.map_entry_layout()?
        } else {
            (0, ty.elem_stride()?)
        };

        self.b.load(Width::W4, false, Reg::R1, base, off + 4);
        self.b.load_ptr(Reg::P1, base, off);

        let header = if is_map { 6 } else { 5 };
        out.reserve(self, header);
        if let Some(key) = &key {
            out.imm(self, Width::W1, wire::tag_of(key.kind) as u64);
        }
        out.imm(self, Width::W1, wire::tag_of(val.kind) as u64);
        out.int(self, Width::W4, Reg::R1);

        if ty.kind == Kind::Set {
            let index = self.type_index(&val);
            self.b.mov_imm(Reg::R2, index as u64);
            self.b.call(runtime::SET_CHECK, &[Reg::R2, Reg::P1, Reg::R1], &[]);
        }

        let done = self.b.label();
        self.b.branch_imm(Cond::Eq, Reg::R1, 0, done);

        let fixed = match &key {
            Some(k) => k.fixed_wire_size().zip(val.fixed_wire_size()).map(|(a, b)| a + b),
            None => val.fixed_wire_size(),
        };
        if let Some(size) = fixed {
            if out.fixed_run(self, Reg::R1, size) {
                self.b.bind(done);
                return Ok(());
            }
            // One check covers every element.
            self.b.mul_imm(Reg::R0, Reg::R1, size as i32);
            out.reserve_reg(self, Reg::R0);
        }

        let simple = is_simple(&val) && key.as_deref().is_none_or(is_simple);
        let lp = self.b.label();
        if simple {
            self.b.bind(lp);
            self.enc_entry(key.as_ref(), &val, val_off, fixed.is_some(), out)?;
            self.b.seek(Reg::P1, Reg::P1, stride as i32);
            self.b.add_imm(Reg::R1, Reg::R1, -1);
            self.b.branch_imm(Cond::Ne, Reg::R1, 0, lp);
        } else {
            self.b.enter();
            self.b.store_frame(Reg::P1, 0);
            self.b.store_frame(Reg::R1, 1);
            self.b.bind(lp);
            self.enc_entry(key.as_ref(), &val, val_off, false, out)?;
            self.b.load_frame(Reg::P1, 0);
            self.b.load_frame(Reg::R1, 1);
            self.b.seek(Reg::P1, Reg::P1, stride as i32);
            self.b.add_imm(Reg::R1, Reg::R1, -1);
            self.b.store_frame(Reg::P1, 0);
            self.b.store_frame(Reg::R1, 1);
            self.b.branch_imm(Cond::Ne, Reg::R1, 0, lp);
            self.b.leave();
        }
        self.b.bind(done);
        Ok(())
    }

    /// One list element or map entry at `p1`.
    fn enc_entry(
        &mut self,
        key: Option<&Arc<TypeDescriptor>>,
        val: &Arc<TypeDescriptor>,
        val_off: u32,
        prechecked: bool,
        out: &dyn Output,
    ) -> Result<(), CompileError> {
        if let Some(key) = key {
            self.enc_element(key, 0, prechecked, out)?;
            if !is_simple(key) {
                self.b.load_frame(Reg::P1, 0);
            }
        }
        self.enc_element(val, val_off, prechecked, out)
    }

    fn enc_element(&mut self, ty: &Arc<TypeDescriptor>, off: u32, prechecked: bool, out: &dyn Output) -> Result<(), CompileError> {
        if prechecked && ty.kind.is_scalar() {
            let width = scalar_width(ty)?;
            self.b.load(width, false, Reg::R0, Reg::P1, off);
            out.int(self, width, Reg::R0);
            return Ok(());
        }
        self.enc_value(ty, Reg::P1, off, out)
    }
}
